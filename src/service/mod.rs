pub mod ack;
pub mod broker;
pub mod keyed_lock;
pub mod mailbox;
pub mod notify;
pub mod topic;

pub use ack::AckAggregator;
pub use broker::{DeliveryBroker, PublishHandle};
pub use mailbox::{Delivery, Mailbox, MailboxId, MailboxRegistry, MailboxStream};
pub use notify::Notifier;
pub use topic::{SendOutcome, Topic, TopicSet};
