pub(crate) mod alternate;
pub(crate) mod reliable;

/// Which transport ended up carrying the session.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransportKind {
    /// The crate's own reliable stream over the punched datagram link.
    ReliableStream,
    /// The externally supplied secure transport.
    Alternate,
}
