pub mod accounts;
pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod coursework;
pub mod files;
pub mod rankings;
pub mod schedules;
