/*
 * Cooperative socket primitives: blocking-shaped calls that park the
 * running task until the poller reports readiness or a timeout fires.
 */

mod socket;

pub use socket::Socket;
