//! Shared error type for parsing and validation of fundamental types.

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("invalid account encoding")]
    InvalidAccount,

    #[error("endpoint has no colon separator")]
    EndpointMissingColon,

    #[error("endpoint has no port")]
    EndpointMissingPort,

    #[error("endpoint port is not numeric")]
    EndpointInvalidPort,

    #[error("endpoint has no address")]
    EndpointMissingAddress,

    #[error("endpoint address is unparseable")]
    EndpointInvalidAddress,
}
