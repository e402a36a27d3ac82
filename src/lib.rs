//! Task and category backend where tasks embed copies of their categories and
//! a synchronizer keeps those copies in step with the category records.

pub mod cli;
pub mod config;
pub mod controllers;
pub mod models;
pub mod storage;
pub mod synchronizer;
pub mod users;
pub mod validation;
