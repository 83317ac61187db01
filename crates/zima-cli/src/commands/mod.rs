pub(crate) mod agents;
pub(crate) mod permissions;
pub(crate) mod serve;
pub(crate) mod sessions;
pub(crate) mod tools;
