pub mod alerts;
pub mod annotations;
pub mod health;
pub mod notifications;
