mod delivery;
mod dispatcher;
mod payload;

pub use delivery::{DeliveryService, LocalDelivery};
pub use dispatcher::{DeliveryOutcome, NotificationDispatcher};
pub use payload::{completion_handle, completion_payload, ordinal};
