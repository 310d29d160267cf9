mod schema;
#[allow(clippy::module_inception)]
mod store;

pub use store::{
    Batch, ChainCursorStore, ChannelStateStore, EventLogStore, SecretStore, Store,
};

pub(crate) use store::{deserialize_from_slice, serialize_to_vec};

#[cfg(test)]
mod tests;
