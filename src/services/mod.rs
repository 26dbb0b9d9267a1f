pub mod backoff;
pub mod cdn;
pub mod credentials;
pub mod image;
pub mod inflight;
pub mod lifecycle;
pub mod poller;
pub mod remote;
