use std::fmt;

/// Progress of a provisioning run. Transitions only move forward, one step
/// at a time; a failed stage leaves the state where it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Uninitialized,
    Created,
    DependenciesInstalled,
    Relocatable,
}

impl PipelineState {
    /// The state that must hold before moving to `self`.
    pub fn predecessor(self) -> Option<PipelineState> {
        match self {
            PipelineState::Uninitialized => None,
            PipelineState::Created => Some(PipelineState::Uninitialized),
            PipelineState::DependenciesInstalled => Some(PipelineState::Created),
            PipelineState::Relocatable => Some(PipelineState::DependenciesInstalled),
        }
    }

    pub fn can_advance_to(self, to: PipelineState) -> bool {
        to.predecessor() == Some(self)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Created => "created",
            PipelineState::DependenciesInstalled => "dependencies-installed",
            PipelineState::Relocatable => "relocatable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(PipelineState::Uninitialized.can_advance_to(PipelineState::Created));
        assert!(PipelineState::Created.can_advance_to(PipelineState::DependenciesInstalled));
        assert!(PipelineState::DependenciesInstalled.can_advance_to(PipelineState::Relocatable));
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!PipelineState::Uninitialized.can_advance_to(PipelineState::Relocatable));
        assert!(!PipelineState::Created.can_advance_to(PipelineState::Created));
        assert!(!PipelineState::Relocatable.can_advance_to(PipelineState::Created));
        assert!(!PipelineState::Relocatable.can_advance_to(PipelineState::Uninitialized));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            PipelineState::DependenciesInstalled.to_string(),
            "dependencies-installed"
        );
        assert_eq!(PipelineState::default().to_string(), "uninitialized");
    }
}
