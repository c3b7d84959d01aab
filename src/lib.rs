pub mod audit;
pub mod connector;
pub mod core;
pub mod ingest;
pub mod mailbox;
pub mod notify;
pub mod parser;
pub mod scheduler;
pub mod ticketing;
