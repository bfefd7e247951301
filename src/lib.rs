pub mod action;
pub mod commands;
pub mod config;
pub mod gateway;
pub mod models;
pub mod render;
pub mod session;
pub mod state;
