/// Truthy check matching the shell convention: unset, empty, "0", "false",
/// "no" and "off" are off, anything else is on.
fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let v = value.trim().to_ascii_lowercase();
            !(v.is_empty() || v == "0" || v == "false" || v == "no" || v == "off")
        }
        Err(_) => false,
    }
}

pub fn debug_model_routing() -> bool {
    env_truthy("SUB2API_DEBUG_MODEL_ROUTING")
}

pub fn debug_claude_mimic() -> bool {
    env_truthy("SUB2API_DEBUG_CLAUDE_MIMIC")
}

#[cfg(test)]
mod tests {
    use super::env_truthy;

    #[test]
    fn truthy_values() {
        // Unique names: env vars are process-global across test threads.
        unsafe { std::env::set_var("SUBGATE_TEST_TRUTHY_A", "1") };
        assert!(env_truthy("SUBGATE_TEST_TRUTHY_A"));
        unsafe { std::env::set_var("SUBGATE_TEST_TRUTHY_B", "off") };
        assert!(!env_truthy("SUBGATE_TEST_TRUTHY_B"));
        assert!(!env_truthy("SUBGATE_TEST_TRUTHY_UNSET"));
    }
}
