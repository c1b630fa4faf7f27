use crate::gateway::PageProbe;
use crate::types::Action;

/// Observes post-action effects and produces a one-line human-readable
/// summary for the step log.
pub trait Verifier: Send + Sync {
    fn report(&self, action: &Action, before: &PageProbe, after: &PageProbe) -> String;
}

/// Default verifier: names what changed, or says nothing did.
pub struct ReportVerifier;

impl Verifier for ReportVerifier {
    fn report(&self, action: &Action, before: &PageProbe, after: &PageProbe) -> String {
        let mut effects = Vec::new();
        if before.url != after.url {
            effects.push(format!("navigated to {}", after.url));
        }
        if before.title != after.title && !after.title.is_empty() {
            effects.push(format!("title is now \"{}\"", after.title));
        }
        if effects.is_empty() && before.text != after.text {
            effects.push("page content updated".to_string());
        }

        if effects.is_empty() {
            format!("{} produced no visible change", action.kind())
        } else {
            format!("{}: {}", action.kind(), effects.join("; "))
        }
    }
}
