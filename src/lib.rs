pub mod api;
pub mod controllers;
pub mod health;
pub mod install;
pub mod registry;
pub mod util;

#[cfg(test)]
pub mod fixtures;
