//! # Pharmonico Stages
//!
//! The workflow's stage handlers, one per topic:
//!
//! | Stage | Consumes | Moves to | Emits |
//! |---|---|---|---|
//! | [`ValidationStage`] | `intake.received` | `validated` / `validation_failed` | `validation.completed` |
//! | [`EnrollmentStage`] | `validation.completed` | `enrolled` | `enrollment.completed` |
//! | [`RoutingStage`] | `enrollment.completed` | `pharmacy_selected` | `pharmacy.selected` |
//! | [`AdjudicationStage`] | `pharmacy.selected` | `adjudicated` | `adjudication.completed` |
//! | [`PaymentStage`] | `adjudication.completed` | `payment_waived` / `awaiting_payment` | `payment.completed` / `payment.link.created` |
//! | [`ShippingStage`] | `payment.completed` | `shipped` | `shipment.label.created` |
//! | [`DeliveryStage`] | `shipment.label.created` | `in_transit` | |
//! | [`DeliveryConfirmationStage`] | `shipment.delivered` | `delivered` | |
//!
//! Every stage is replay-safe. A stage handed a prescription it already
//! moved re-emits the successor it recorded the first time, without
//! repeating side effects; a prescription further along is left alone.
//!
//! ## Example
//!
//! ```no_run
//! use pharmonico_core::registry::HandlerRegistry;
//! use pharmonico_core::coordination::CapacityTracker;
//! use pharmonico_stages::{Pharmacy, StageConfig, StageContext, StaticPharmacyDirectory, register_workflow};
//! use pharmonico_testing::{InMemoryBroker, InMemoryCache, InMemoryPrescriptionStore};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let ctx = StageContext::new(
//!     Arc::new(InMemoryPrescriptionStore::new()),
//!     Arc::new(broker.producer()),
//! );
//! let directory = StaticPharmacyDirectory::new(vec![Pharmacy::new("ph-1", "1234567", 100)]);
//!
//! let registry = HandlerRegistry::new();
//! register_workflow(
//!     &registry,
//!     &ctx,
//!     &CapacityTracker::new(InMemoryCache::new()),
//!     Arc::new(directory),
//!     &StageConfig::default(),
//! )?;
//! assert_eq!(registry.len(), 8);
//! # Ok(())
//! # }
//! ```

mod adjudication;
mod context;
mod delivery;
mod enrollment;
mod payment;
mod routing;
mod shipping;
mod validation;

pub use adjudication::{AdjudicationPolicy, AdjudicationStage};
pub use context::{Progress, StageContext};
pub use delivery::{DeliveryConfirmationStage, DeliveryStage};
pub use enrollment::EnrollmentStage;
pub use payment::{DEFAULT_PAYMENT_LINK_BASE_URL, PaymentStage};
pub use routing::{
    DirectoryFuture, Pharmacy, PharmacyDirectory, RoutingStage, StaticPharmacyDirectory,
};
pub use shipping::{DEFAULT_CARRIER, DEFAULT_LABEL_BASE_URL, ShippingStage, tracking_number};
pub use validation::{ValidationStage, validate};

use pharmonico_core::cache::Cache;
use pharmonico_core::coordination::CapacityTracker;
use pharmonico_core::coordination::capacity::DEFAULT_CAPACITY_THRESHOLD;
use pharmonico_core::registry::{HandlerRegistry, RegistryError};
use std::sync::Arc;

/// Settings the stages share.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Utilization at which routing passes a pharmacy over
    pub capacity_threshold: f64,
    /// Claim outcome used by adjudication
    pub adjudication: AdjudicationPolicy,
    /// Host of payment links
    pub payment_link_base_url: String,
    /// Host of shipping labels
    pub label_base_url: String,
    /// Carrier written on labels
    pub carrier: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            capacity_threshold: DEFAULT_CAPACITY_THRESHOLD,
            adjudication: AdjudicationPolicy::default(),
            payment_link_base_url: DEFAULT_PAYMENT_LINK_BASE_URL.to_string(),
            label_base_url: DEFAULT_LABEL_BASE_URL.to_string(),
            carrier: DEFAULT_CARRIER.to_string(),
        }
    }
}

/// Register all eight stages.
///
/// # Errors
///
/// Returns [`RegistryError`] if a stage's topic is rejected by the registry.
pub fn register_workflow<C: Cache + Clone + 'static>(
    registry: &HandlerRegistry,
    ctx: &StageContext,
    capacity: &CapacityTracker<C>,
    directory: Arc<dyn PharmacyDirectory>,
    config: &StageConfig,
) -> Result<(), RegistryError> {
    registry.register(Arc::new(ValidationStage::new(ctx.clone())))?;
    registry.register(Arc::new(EnrollmentStage::new(ctx.clone())))?;
    registry.register(Arc::new(RoutingStage::new(
        ctx.clone(),
        capacity.clone(),
        Arc::clone(&directory),
        config.capacity_threshold,
    )))?;
    registry.register(Arc::new(AdjudicationStage::new(
        ctx.clone(),
        config.adjudication.clone(),
    )))?;
    registry.register(Arc::new(PaymentStage::new(
        ctx.clone(),
        config.payment_link_base_url.clone(),
    )))?;
    registry.register(Arc::new(ShippingStage::new(
        ctx.clone(),
        config.label_base_url.clone(),
        config.carrier.clone(),
    )))?;
    registry.register(Arc::new(DeliveryStage::new(ctx.clone())))?;
    registry.register(Arc::new(DeliveryConfirmationStage::new(
        ctx.clone(),
        capacity.clone(),
        directory,
    )))?;

    tracing::info!(stages = registry.len(), "Workflow stages registered");
    Ok(())
}
