//! `PostgreSQL` document store for Pharmonico.
//!
//! This crate provides [`PostgresPrescriptionStore`], which implements the
//! `PrescriptionStore` trait from `pharmonico-core`. Each prescription is one
//! JSONB document keyed by its id; the status is mirrored into its own column
//! so operational queries can filter on it without touching the document.
//!
//! # Example
//!
//! ```no_run
//! use pharmonico_postgres::PostgresPrescriptionStore;
//! use pharmonico_core::prescription::PrescriptionStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresPrescriptionStore::connect("postgres://localhost/pharmonico").await?;
//! store.migrate().await?;
//!
//! if let Some(prescription) = store.get("rx_1").await? {
//!     println!("{} is {}", prescription.id, prescription.status);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::PostgresPrescriptionStore;
