pub mod contacts;
pub mod conversions;
pub mod health;
pub mod identities;
pub mod reports;
pub mod sessions;
pub mod touchpoints;
