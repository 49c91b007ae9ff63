//! Canonical lock-key names used across the pipeline.

/// Guards GlobalSpec.style mutation.
pub fn global_style(project_id: &str) -> String {
    format!("project:{project_id}:global_style")
}

/// Guards the DNA bank.
pub fn dna_bank(project_id: &str) -> String {
    format!("project:{project_id}:dna_bank")
}

/// Guards one shot.
pub fn shot(project_id: &str, shot_id: &str) -> String {
    format!("project:{project_id}:shot:{shot_id}")
}

/// Scope lock for batch shot updates.
pub fn shots_scope(project_id: &str) -> String {
    format!("project:{project_id}:shots")
}

/// Prefix matching every lock of one project.
pub fn project_prefix(project_id: &str) -> String {
    format!("project:{project_id}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_match_the_wire_convention() {
        assert_eq!(global_style("p1"), "project:p1:global_style");
        assert_eq!(dna_bank("p1"), "project:p1:dna_bank");
        assert_eq!(shot("p1", "S01"), "project:p1:shot:S01");
        assert_eq!(shots_scope("p1"), "project:p1:shots");
    }
}
