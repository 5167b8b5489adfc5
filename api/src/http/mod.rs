pub mod apps;
pub mod connection;
pub mod dashboard;
pub mod events;
pub mod keys;
pub mod relays;
pub mod requests;
pub mod routes;
pub mod tokens;
