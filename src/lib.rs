pub mod alert;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingress;
pub mod node;
pub mod paging;
pub mod scheduler;
pub mod shutdown;
pub mod transfer;
pub mod worker;
