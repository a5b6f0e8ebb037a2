use bitcoin::{hashes::Hash, OutPoint, Txid};

/// Serialized width of one history row.
pub const HISTORY_ROW_SIZE: usize = 88;

/// Serialized width of one stealth row.
pub const STEALTH_ROW_SIZE: usize = 84;

/// One row of payment address history: the receiving output point and, if
/// spent, the spending input point. Unspent rows carry a zeroed spend
/// point and a spend height of `u32::MAX`.
///
/// Wire layout (88 bytes):
/// `out_hash:32 out_index:4 out_height:4 value:8 spend_hash:32 spend_index:4 spend_height:4`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
	pub output: OutPoint,
	pub output_height: u32,
	pub value: u64,
	pub spend: OutPoint,
	pub spend_height: u32,
}

impl HistoryRow {
	pub fn write(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.output.txid.to_byte_array());
		out.extend_from_slice(&self.output.vout.to_le_bytes());
		out.extend_from_slice(&self.output_height.to_le_bytes());
		out.extend_from_slice(&self.value.to_le_bytes());
		out.extend_from_slice(&self.spend.txid.to_byte_array());
		out.extend_from_slice(&self.spend.vout.to_le_bytes());
		out.extend_from_slice(&self.spend_height.to_le_bytes());
	}

	pub fn read(row: &[u8]) -> Option<Self> {
		if row.len() != HISTORY_ROW_SIZE {
			return None
		}
		Some(HistoryRow {
			output: read_point(&row[..36]),
			output_height: read_u32(&row[36..40]),
			value: u64::from_le_bytes(row[40..48].try_into().expect("8 bytes")),
			spend: read_point(&row[48..84]),
			spend_height: read_u32(&row[84..88]),
		})
	}
}

/// One row of a stealth query result.
///
/// Wire layout (84 bytes): `ephemeral_key:32 address_hash:20 tx_hash:32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthRow {
	pub ephemeral_key: [u8; 32],
	pub address_hash: [u8; 20],
	pub transaction_hash: Txid,
}

impl StealthRow {
	pub fn write(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.ephemeral_key);
		out.extend_from_slice(&self.address_hash);
		out.extend_from_slice(&self.transaction_hash.to_byte_array());
	}

	pub fn read(row: &[u8]) -> Option<Self> {
		if row.len() != STEALTH_ROW_SIZE {
			return None
		}
		Some(StealthRow {
			ephemeral_key: row[..32].try_into().expect("32 bytes"),
			address_hash: row[32..52].try_into().expect("20 bytes"),
			transaction_hash: Txid::from_byte_array(row[52..84].try_into().expect("32 bytes")),
		})
	}
}

fn read_point(bytes: &[u8]) -> OutPoint {
	OutPoint {
		txid: Txid::from_byte_array(bytes[..32].try_into().expect("32 bytes")),
		vout: read_u32(&bytes[32..36]),
	}
}

fn read_u32(bytes: &[u8]) -> u32 {
	u32::from_le_bytes(bytes.try_into().expect("4 bytes"))
}
