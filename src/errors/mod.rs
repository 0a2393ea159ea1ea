mod request_error;
mod transport_error;

pub use request_error::{ErrorCode, RequestError};
pub use transport_error::TransportError;
