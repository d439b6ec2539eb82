//! Line-oriented chat relay with a shared avatar cache.
//!
//! Clients speak a plain text protocol over TCP, one message per line with
//! `@`-separated fields (`TEXT@alice@hi`, `AVATAR@bob@pic.png@<base64>`,
//! `RENAME@alice@alicia`). The relay forwards every line to all other
//! connected clients, remembers which name each connection last used, and
//! replays cached avatars to newcomers.
//!
//! - [`cli`] parses the command-line interface for relay and client modes.
//! - [`codec`] frames TCP byte streams into lines.
//! - [`message`] parses and encodes protocol lines.
//! - [`registry`] holds connections, names, and avatars, and broadcasts.
//! - [`relay`] accepts connections and runs one task per client.
//! - [`client`] is a terminal client for the same protocol.

pub mod cli;
pub mod client;
pub mod codec;
pub mod message;
pub mod registry;
pub mod relay;
