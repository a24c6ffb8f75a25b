pub mod alert;
pub mod annotation;
pub mod notification;
