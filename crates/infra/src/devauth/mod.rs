//! Client of the device authentication service ("devauth"), which issues
//! tokens to admitted devices and must learn about every admission decision.

pub mod client;
pub mod http;

pub use client::{
    ApiError, DEFAULT_TIMEOUT, DevAuthClient, DevAuthConfig, DevAuthError, PreAuthPayload,
    StatusRequest,
};
pub use http::{HttpRequest, HttpResponse, HttpRunner, RecordingRunner, ReqwestRunner, TransportError};
