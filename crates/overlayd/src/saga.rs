//! Ordered kernel steps with inverses.
//!
//! A [`Saga`] applies steps one at a time. When a step fails, the steps
//! already applied are undone in reverse order; failures while undoing are
//! logged and do not stop the rollback.

use overlay_common::{LinkLayer, Neighbor, OverlayError, OverlayResult, Route};
use std::fmt;
use tracing::{debug, error};

/// One reversible kernel mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelStep {
    /// Permanent ARP entry on the link.
    Neighbor { link_index: u32, neigh: Neighbor },
    /// Forwarding-database entry on the link.
    Fdb { link_index: u32, neigh: Neighbor },
    /// Route, installed with replace semantics.
    Route(Route),
}

impl KernelStep {
    pub async fn apply(&self, link: &dyn LinkLayer) -> OverlayResult<()> {
        match self {
            KernelStep::Neighbor { link_index, neigh } => link.neigh_add(*link_index, neigh).await,
            KernelStep::Fdb { link_index, neigh } => link.fdb_add(*link_index, neigh).await,
            KernelStep::Route(route) => link.route_replace(route).await,
        }
    }

    pub async fn undo(&self, link: &dyn LinkLayer) -> OverlayResult<()> {
        match self {
            KernelStep::Neighbor { link_index, neigh } => link.neigh_del(*link_index, neigh).await,
            KernelStep::Fdb { link_index, neigh } => link.fdb_del(*link_index, neigh).await,
            KernelStep::Route(route) => link.route_del(route).await,
        }
    }
}

impl fmt::Display for KernelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelStep::Neighbor { neigh, .. } => write!(f, "ARP {}", neigh),
            KernelStep::Fdb { neigh, .. } => write!(f, "FDB {}", neigh),
            KernelStep::Route(route) => write!(f, "route {}", route),
        }
    }
}

/// Steps applied so far for one logical change.
pub struct Saga<'a> {
    link: &'a dyn LinkLayer,
    applied: Vec<KernelStep>,
}

impl<'a> Saga<'a> {
    pub fn new(link: &'a dyn LinkLayer) -> Self {
        Self {
            link,
            applied: Vec::new(),
        }
    }

    /// Apply `step`; on failure roll back everything applied before it.
    pub async fn step(&mut self, step: KernelStep) -> OverlayResult<()> {
        match step.apply(self.link).await {
            Ok(()) => {
                debug!(step = %step, "Applied");
                self.applied.push(step);
                Ok(())
            }
            Err(e) => {
                error!(step = %step, error = %e, "Step failed, rolling back");
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Apply all steps in order, stopping and rolling back at the first failure.
    pub async fn run(link: &'a dyn LinkLayer, steps: Vec<KernelStep>) -> OverlayResult<()> {
        let mut saga = Self::new(link);
        for step in steps {
            saga.step(step).await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        while let Some(step) = self.applied.pop() {
            if let Err(e) = step.undo(self.link).await {
                error!(step = %step, error = %e, "Compensation failed");
            }
        }
    }
}

/// Undo every step independently; returns the failures.
pub async fn undo_all(link: &dyn LinkLayer, steps: &[KernelStep]) -> Vec<OverlayError> {
    let mut errors = Vec::new();
    for step in steps {
        if let Err(e) = step.undo(link).await {
            error!(step = %step, error = %e, "Delete failed");
            errors.push(e);
        }
    }
    errors
}
