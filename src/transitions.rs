//! Allowed-edge tables for every lifecycle state machine.
//!
//! Each state column is only ever moved through [`check`], so an illegal edge is
//! rejected here and nowhere else.

use crate::error::{LifecycleError, Result};
use crate::model::{EnrollmentState, PeriodState, SupplementaryState, TrimesterState};

pub trait StateMachine: Copy + PartialEq + std::fmt::Display + 'static {
    const NAME: &'static str;
    const EDGES: &'static [(Self, Self)];

    fn can_transition(self, to: Self) -> bool {
        Self::EDGES.iter().any(|(a, b)| *a == self && *b == to)
    }
}

impl StateMachine for PeriodState {
    const NAME: &'static str = "period";
    const EDGES: &'static [(Self, Self)] = &[(PeriodState::Activo, PeriodState::Finalizado)];
}

impl StateMachine for TrimesterState {
    const NAME: &'static str = "trimester";
    const EDGES: &'static [(Self, Self)] = &[
        (TrimesterState::Pendiente, TrimesterState::Activo),
        (TrimesterState::Activo, TrimesterState::Finalizado),
    ];
}

impl StateMachine for SupplementaryState {
    const NAME: &'static str = "supplementary";
    // PENDIENTE -> CERRADO and CERRADO -> PENDIENTE are the two missing edges.
    const EDGES: &'static [(Self, Self)] = &[
        (SupplementaryState::Pendiente, SupplementaryState::Activado),
        (SupplementaryState::Activado, SupplementaryState::Cerrado),
        (SupplementaryState::Activado, SupplementaryState::Pendiente),
        (SupplementaryState::Cerrado, SupplementaryState::Activado),
    ];
}

impl StateMachine for EnrollmentState {
    const NAME: &'static str = "enrollment";
    const EDGES: &'static [(Self, Self)] = &[
        (EnrollmentState::Activo, EnrollmentState::Retirado),
        (EnrollmentState::Activo, EnrollmentState::Finalizado),
    ];
}

pub fn check<S: StateMachine>(from: S, to: S) -> Result<()> {
    if from.can_transition(to) {
        return Ok(());
    }
    tracing::warn!(machine = S::NAME, %from, %to, "refused state transition");
    Err(LifecycleError::IllegalTransition {
        machine: S::NAME,
        from: from.to_string(),
        to: to.to_string(),
    })
}
