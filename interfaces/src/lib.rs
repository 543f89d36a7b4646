//! MAC-PHY Message Dictionary
//!
//! This crate defines the messages exchanged between the MAC and the PHY
//! engine. The MAC itself is out of scope; it is modeled entirely by
//! these messages.

pub mod message_types;

pub use message_types::{MacMessage, PhyEvent};
