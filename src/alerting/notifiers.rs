pub mod alertmanager;
pub mod email;
pub mod webhook;
