//! Quote-to-cash service - quote signing, contracts, change orders, invoicing,
//! payments and commission eligibility.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
