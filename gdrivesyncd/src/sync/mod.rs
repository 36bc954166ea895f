pub mod change;
pub mod checksum;
pub mod cloud_observer;
pub mod error;
pub mod local_observer;
pub mod manifest;
pub mod paths;
pub mod processor;
pub mod reconcile;
pub mod repository;
