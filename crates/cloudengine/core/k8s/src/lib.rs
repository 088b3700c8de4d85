pub mod bootstrap;
pub mod client;
pub mod connector;
pub mod manager;
pub mod name;
pub mod scheme;
pub mod singleton;
