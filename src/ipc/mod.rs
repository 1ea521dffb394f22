pub mod channel;
pub mod request;
pub mod response;
pub mod state;
pub mod transport;

pub use channel::{IpcRequestChannel, RequestService, RequestState};
pub use request::{IpcReply, IpcRequest, Param};
pub use response::ResponseArea;
pub use state::{ApplicationState, Perspective, SharedStatus, STATUS_RECORD_LEN};
pub use transport::{pair, DeliveryFailure, FlumeTransport, PeerEndpoint, Transport};
