pub mod descriptor;
pub mod error;
pub mod matcher;
pub mod registry_client;
