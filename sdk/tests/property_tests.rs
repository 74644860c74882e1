use proptest::prelude::*;
use sdk::errors::{EngineError, FlowErrorExt};
use sdk::types::{BotId, StepId};
use uuid::Uuid;

proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Database(error_str.clone()),
            EngineError::StepNotFound(error_str.clone()),
            EngineError::PresetEvaluation(error_str.clone()),
            EngineError::CredentialNotFound(error_str.clone()),
            EngineError::RequestExecutionFailed(error_str.clone()),
            EngineError::CredentialResolutionFailed {
                bot: error_str.clone(),
                provider: error_str.clone(),
                strategy: error_str.clone(),
            },
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            // Hints are static and never echo caller-supplied text
            if error_str.len() > 8 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }

    #[test]
    fn test_derived_step_ids_are_bot_scoped(key in "[a-z][a-z0-9-]{0,24}") {
        let a = BotId::new();
        let b = BotId::new();
        let in_a = StepId::derived(a.as_uuid(), &key);
        let in_b = StepId::derived(b.as_uuid(), &key);
        prop_assert_eq!(in_a, StepId::derived(a.as_uuid(), &key));
        prop_assert_ne!(in_a, in_b);
    }

    #[test]
    fn test_ids_parse_from_display(raw in any::<u128>()) {
        let id = StepId(Uuid::from_u128(raw));
        let parsed: StepId = id.to_string().parse().expect("display output parses");
        prop_assert_eq!(id, parsed);
    }
}
