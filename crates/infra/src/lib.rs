//! Infrastructure layer: auth set storage, schema migrations and the devauth client.

pub mod devauth;
pub mod migrate;
pub mod store;
