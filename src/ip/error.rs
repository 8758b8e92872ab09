/// Failures of the IP transport.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid TCP Handle {0}")]
    InvalidHandle(usize),
    #[error("TCP Handle {0} Closed")]
    HandleClosed(usize),
    #[error("UDP Sockets Not Initialized")]
    NotInitialized,
    #[error("Malformed Address Header")]
    MalformedHeader,
    #[error("Message Too Long: {0} bytes")]
    MessageTooLong(u32),
    #[error("Socket Error: {0}")]
    Socket(std::io::Error),
    #[error("Connect Failed: {0}")]
    Connect(std::io::Error),
    #[error("Negative Acknowledge 0x{0:02x}")]
    NegativeAcknowledge(u8),
    #[error("Routing Activation Rejected 0x{0:02x}")]
    RoutingActivationRejected(u8),
}
