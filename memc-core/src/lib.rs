//! Runtime-independent building blocks for memcached cluster clients:
//! node addresses, the text protocol codec, and the Ketama consistent
//! hash ring. Async runtimes plug in on top of this crate.

pub mod address;
pub mod protocol;
pub mod ring;
