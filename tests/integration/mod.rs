//! Integration tests for nat-redirect

mod lifecycle;
mod resolve;
mod table;
