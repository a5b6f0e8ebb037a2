use std::sync::Arc;

use gateway_protocol::{commands, Message};

use crate::{subscriptions::SubscriptionManager, workers::QueryWorker};

/// Subscription commands answer synchronously on the worker thread; the
/// reply is always an error code only.
pub fn attach(worker: &QueryWorker, subscriptions: Arc<SubscriptionManager>) {
	worker.attach(commands::SUBSCRIBE, {
		let subscriptions = subscriptions.clone();
		move |request, sender| {
			let code = subscriptions.subscribe(&request);
			sender.send(Message::error(&request, code));
		}
	});

	worker.attach(commands::RENEW, {
		let subscriptions = subscriptions.clone();
		move |request, sender| {
			let code = subscriptions.renew(&request);
			sender.send(Message::error(&request, code));
		}
	});

	worker.attach(commands::UNSUBSCRIBE, {
		move |request, sender| {
			let code = subscriptions.unsubscribe(&request);
			sender.send(Message::error(&request, code));
		}
	});
}
