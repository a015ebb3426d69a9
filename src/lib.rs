//! Courier routes envelopes between agents.
//!
//! Re-exports the two workspace libraries:
//!
//! - [`mesh`]: the envelope model, transport ports, subscriber registry and
//!   the pub/sub receive loop;
//! - [`http`]: the HTTP bridge, the HTTP sender and forwarding.

pub use courier_http as http;
pub use courier_mesh as mesh;

pub use courier_http::{BridgeConfig, BridgeConfigBuilder, BridgeServer, HttpSender};
pub use courier_mesh::{
    AgentId, Channel, Envelope, InMemoryPubSub, MessageType, PubSub, Receiver, ReceiverConfig,
    Recipient, Sender, Subscriber,
};
