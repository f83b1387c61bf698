pub mod credentials;
pub mod repository;
pub mod worker;
