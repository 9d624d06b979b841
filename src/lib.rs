#[macro_use]
extern crate rocket;

pub mod auth;
pub mod auth_guard;
pub mod config;
pub mod db;
pub mod form;
pub mod listing;
pub mod models;
pub mod money;
pub mod provision;
pub mod storage;
pub mod web;
