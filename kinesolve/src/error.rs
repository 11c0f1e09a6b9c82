#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainType {
    Structure,
    Chain,
    Tree,
    Solver,
}

#[derive(Debug)]
pub struct KinesolveError {
    reason: String,
    recovery_suggestion: String,
    code: i32,
    domain: DomainType,
}

impl std::fmt::Display for KinesolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let recovery_hint = if self.recovery_suggestion.is_empty() {
            "".to_owned()
        } else {
            format!("(Try \"{}\" to recover)", self.recovery_suggestion)
        };
        write!(
            f,
            "[{:?} - {}]{}{}",
            self.domain, self.code, self.reason, recovery_hint
        )
    }
}

impl std::error::Error for KinesolveError {}

impl KinesolveError {
    pub fn new(reason: &str, recovery_suggestion: &str, domain: DomainType) -> Self {
        Self {
            reason: reason.to_owned(),
            recovery_suggestion: recovery_suggestion.to_owned(),
            code: 0,
            domain,
        }
    }

    pub fn missing_parent(parent: usize) -> Self {
        Self {
            reason: format!("Parent joint {} is not in the joint set", parent),
            recovery_suggestion: "Append parents before their children".to_owned(),
            code: 1,
            domain: DomainType::Structure,
        }
    }

    pub fn second_root() -> Self {
        Self {
            reason: "Joint set already has a root".to_owned(),
            recovery_suggestion: "Give the new joint a parent or use a separate joint set"
                .to_owned(),
            code: 2,
            domain: DomainType::Structure,
        }
    }

    pub fn unknown_joint(joint: usize) -> Self {
        Self {
            reason: format!("Joint {} is not in the joint set", joint),
            recovery_suggestion: "".to_owned(),
            code: 3,
            domain: DomainType::Structure,
        }
    }

    pub fn empty_chain() -> Self {
        Self {
            reason: "Chain has no joints".to_owned(),
            recovery_suggestion: "".to_owned(),
            code: 4,
            domain: DomainType::Chain,
        }
    }

    pub fn chain_too_short(len: usize) -> Self {
        Self {
            reason: format!("Chain of {} joints has no bone to solve", len),
            recovery_suggestion: "Give the chain at least two joints".to_owned(),
            code: 7,
            domain: DomainType::Chain,
        }
    }

    pub fn broken_chain(position: usize) -> Self {
        Self {
            reason: format!(
                "Chain joint at position {} is not a child of its predecessor",
                position
            ),
            recovery_suggestion: "Build chains tip-up from JointSet::parent_of".to_owned(),
            code: 5,
            domain: DomainType::Chain,
        }
    }

    pub fn unknown_effector(joint: usize) -> Self {
        Self {
            reason: format!("Joint {} is not an end effector of this solver", joint),
            recovery_suggestion: "Target one of the tree's leaf chain tips".to_owned(),
            code: 6,
            domain: DomainType::Tree,
        }
    }
}
