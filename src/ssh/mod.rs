pub mod exec;
pub mod handler;
pub mod transport;

pub use exec::{CommandOutput, CommandRunner, RemoteCommandRunner};
pub use transport::{SessionPurpose, SshSession, TransportFactory};
