//! IRC bot that keeps one connection to the server and shares it with a
//! keep-alive process and one worker process per managed channel.

#[cfg(not(unix))]
compile_error!("irc-relay-bot shares one socket across processes and needs a Unix host");

pub mod backend;
pub mod config;
pub mod connection;
pub mod gate;
pub mod irc;
pub mod mute;
pub mod pinger;
pub mod pipe;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod spawner;
pub mod supervisor;
pub mod worker;

mod helpers;
