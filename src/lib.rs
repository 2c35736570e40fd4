pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod messenger;
pub mod processor;
pub mod router;
pub mod scheduler;
pub mod transport;
pub mod util;
pub mod worker;

pub mod test_util;

pub use config::{MessengerConfig, TransportSpec};
pub use error::MessagingError;
pub use message::{ContentType, DeliveryOptions, Message, MessageFlags};
pub use messenger::Messenger;
pub use processor::DeliveryStatus;
pub use worker::Stats;
