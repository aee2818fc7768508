//! Plan catalog
//!
//! Static mapping from plan identifier to seat limits, plus the provider
//! price ids that resolve to each plan. Built once at startup and passed
//! explicitly to the subscription handler; never mutated afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Seat/resource limits enforced by the rest of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLimits {
    pub max_students: u32,
    pub max_teachers: u32,
}

impl SeatLimits {
    pub const fn new(max_students: u32, max_teachers: u32) -> Self {
        Self {
            max_students,
            max_teachers,
        }
    }

    /// Whether every limit is at or below `other`
    pub fn within(&self, other: &SeatLimits) -> bool {
        self.max_students <= other.max_students && self.max_teachers <= other.max_teachers
    }
}

/// Limits applied to cancelled organisations. Existing data stays readable
/// but nothing new can be added.
pub const CANCELLED_LIMITS: SeatLimits = SeatLimits::new(0, 1);

/// A purchasable plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub limits: SeatLimits,
}

impl Plan {
    pub fn new(id: &str, name: &str, limits: SeatLimits) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            limits,
        }
    }
}

/// Immutable plan and price lookup
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
    price_to_plan: HashMap<String, String>,
    cancelled_limits: SeatLimits,
}

impl PlanCatalog {
    /// Catalog with the given plans and no price mappings
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
            price_to_plan: HashMap::new(),
            cancelled_limits: CANCELLED_LIMITS,
        }
    }

    /// Built-in plans offered to teaching organisations
    pub fn default_plans() -> Vec<Plan> {
        vec![
            Plan::new("trial", "Trial", SeatLimits::new(50, 5)),
            Plan::new("solo", "Solo Teacher", SeatLimits::new(75, 1)),
            Plan::new("studio", "Studio", SeatLimits::new(300, 10)),
            Plan::new("academy", "Academy", SeatLimits::new(2000, 75)),
        ]
    }

    /// Build the catalog from the built-in plans and price ids in the environment.
    ///
    /// For each plan, `STRIPE_PRICE_<PLAN>_MONTHLY` and `STRIPE_PRICE_<PLAN>_ANNUAL`
    /// are read if present.
    pub fn from_env() -> Self {
        let mut catalog = Self::new(Self::default_plans());
        let plan_ids: Vec<String> = catalog.plans.keys().cloned().collect();

        for plan_id in plan_ids {
            for interval in ["MONTHLY", "ANNUAL"] {
                let key = format!("STRIPE_PRICE_{}_{}", plan_id.to_uppercase(), interval);
                if let Ok(price_id) = std::env::var(&key) {
                    let price_id = price_id.trim();
                    if !price_id.is_empty() {
                        catalog = catalog.with_price(price_id, &plan_id);
                    }
                }
            }
        }

        tracing::info!(
            plans = catalog.plans.len(),
            prices = catalog.price_to_plan.len(),
            "Plan catalog loaded"
        );
        catalog
    }

    /// Map a provider price id to a plan. Unknown plans are ignored.
    pub fn with_price(mut self, price_id: &str, plan_id: &str) -> Self {
        if self.plans.contains_key(plan_id) {
            self.price_to_plan
                .insert(price_id.to_string(), plan_id.to_string());
        } else {
            tracing::warn!(price_id, plan_id, "Ignoring price mapped to unknown plan");
        }
        self
    }

    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    pub fn plan_for_price(&self, price_id: &str) -> Option<&Plan> {
        self.price_to_plan
            .get(price_id)
            .and_then(|plan_id| self.plans.get(plan_id))
    }

    pub fn cancelled_limits(&self) -> SeatLimits {
        self.cancelled_limits
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(Self::default_plans())
    }
}
