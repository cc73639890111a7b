#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod archive;
pub mod catalog;
pub mod fetch;
pub mod harvester;
pub mod ledger;
pub mod store;
pub mod tracker;
pub mod types;
pub mod utils;
