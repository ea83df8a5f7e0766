//! CONNECT credential checks and topic authorization policy.

use crate::config::{AclAction, AclRule, AuthOptions};
use crate::messaging::{MqttTopicMatcher, TopicMatcher};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("credentials missing")]
    MissingCredentials,
    #[error("bad username or password")]
    BadCredentials,
    #[error("token missing or invalid")]
    InvalidToken,
    #[error("unauthorized operation")]
    Unauthorized,
}

/// Operation being authorized for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Subscribe,
}

/// Who is asking; handed to the policy evaluator on a cache miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: u64,
    pub client_id: String,
    pub username: Option<String>,
}

/// Authoritative topic policy. Implementations must be cheap to call and never block.
pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(&self, identity: &SessionIdentity, topic: &str, action: Action) -> bool;
}

/// Ordered allow/deny rules; the first matching rule wins and an empty rule set allows all.
#[derive(Debug, Clone, Default)]
pub struct AclPolicy {
    rules: Vec<AclRule>,
    matcher: MqttTopicMatcher,
}

impl AclPolicy {
    pub fn new(rules: Vec<AclRule>) -> Self {
        Self {
            rules,
            matcher: MqttTopicMatcher,
        }
    }

    /// Subscriptions are checked filter-against-filter: the rule covers the requested filter
    /// when every topic the request could match is matched by the rule.
    fn rules_cover(&self, rule_topic: &str, requested: &str, action: Action) -> bool {
        match action {
            Action::Publish => self.matcher.matches(rule_topic, requested),
            Action::Subscribe => filter_covers(rule_topic, requested),
        }
    }
}

impl PolicyEvaluator for AclPolicy {
    fn evaluate(&self, identity: &SessionIdentity, topic: &str, action: Action) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let decision = self.rules.iter().find(|rule| {
            let action_ok = match (rule.action, action) {
                (AclAction::Any, _) => true,
                (AclAction::Publish, Action::Publish) => true,
                (AclAction::Subscribe, Action::Subscribe) => true,
                _ => false,
            };
            let client_ok = rule
                .client_id
                .as_deref()
                .map_or(true, |id| id == identity.client_id);
            action_ok && client_ok && self.rules_cover(&rule.topic, topic, action)
        });
        decision.is_some_and(|rule| rule.allow)
    }
}

fn filter_covers(rule: &str, requested: &str) -> bool {
    let mut rule_parts = rule.split('/');
    let mut req_parts = requested.split('/');
    loop {
        match (rule_parts.next(), req_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(r)) if r != "#" => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// CONNECT credential check against the configured username/password or token.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    auth: AuthOptions,
}

impl Authenticator {
    pub fn new(auth: AuthOptions) -> Self {
        Self { auth }
    }

    pub fn authorize_connect(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<(), SecurityError> {
        if !self.auth.is_enabled() {
            return Ok(());
        }
        let password = password.and_then(|p| std::str::from_utf8(p).ok());
        if let Some(token) = &self.auth.token {
            if password == Some(token.as_str()) {
                return Ok(());
            }
            if self.auth.username.is_none() {
                return Err(if password.is_none() {
                    SecurityError::MissingCredentials
                } else {
                    SecurityError::InvalidToken
                });
            }
        }
        match (&self.auth.username, &self.auth.password) {
            (Some(user), Some(pass)) => {
                let (Some(got_user), Some(got_pass)) = (username, password) else {
                    return Err(SecurityError::MissingCredentials);
                };
                if got_user == user && got_pass == pass {
                    Ok(())
                } else {
                    Err(SecurityError::BadCredentials)
                }
            }
            _ => Err(SecurityError::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(client_id: &str) -> SessionIdentity {
        SessionIdentity {
            session_id: 1,
            client_id: client_id.into(),
            username: None,
        }
    }

    fn rule(topic: &str, action: AclAction, client_id: Option<&str>, allow: bool) -> AclRule {
        AclRule {
            topic: topic.into(),
            action,
            client_id: client_id.map(Into::into),
            allow,
        }
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = AclPolicy::default();
        assert!(policy.evaluate(&identity("c"), "a/b", Action::Publish));
        assert!(policy.evaluate(&identity("c"), "#", Action::Subscribe));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = AclPolicy::new(vec![
            rule("sensors/secret", AclAction::Publish, None, false),
            rule("sensors/#", AclAction::Any, None, true),
        ]);
        assert!(!policy.evaluate(&identity("c"), "sensors/secret", Action::Publish));
        assert!(policy.evaluate(&identity("c"), "sensors/open", Action::Publish));
        assert!(!policy.evaluate(&identity("c"), "other", Action::Publish));
    }

    #[test]
    fn client_scoped_rules_only_apply_to_that_client() {
        let policy = AclPolicy::new(vec![
            rule("#", AclAction::Any, Some("admin"), true),
            rule("public/#", AclAction::Any, None, true),
        ]);
        assert!(policy.evaluate(&identity("admin"), "private/x", Action::Publish));
        assert!(!policy.evaluate(&identity("guest"), "private/x", Action::Publish));
    }

    #[test]
    fn subscribe_rules_must_cover_the_requested_filter() {
        let policy = AclPolicy::new(vec![rule("sensors/+", AclAction::Subscribe, None, true)]);
        assert!(policy.evaluate(&identity("c"), "sensors/a", Action::Subscribe));
        assert!(policy.evaluate(&identity("c"), "sensors/+", Action::Subscribe));
        assert!(!policy.evaluate(&identity("c"), "sensors/#", Action::Subscribe));
    }

    #[test]
    fn authenticator_checks_user_and_token() {
        let open = Authenticator::default();
        assert!(open.authorize_connect(None, None).is_ok());

        let users = Authenticator::new(AuthOptions {
            username: Some("dev".into()),
            password: Some("pw".into()),
            token: None,
        });
        assert!(users.authorize_connect(Some("dev"), Some(b"pw".as_slice())).is_ok());
        assert_eq!(
            users.authorize_connect(Some("dev"), Some(b"nope".as_slice())),
            Err(SecurityError::BadCredentials)
        );
        assert_eq!(
            users.authorize_connect(None, None),
            Err(SecurityError::MissingCredentials)
        );

        let token = Authenticator::new(AuthOptions {
            token: Some("t0k".into()),
            ..AuthOptions::default()
        });
        assert!(token.authorize_connect(None, Some(b"t0k".as_slice())).is_ok());
        assert_eq!(
            token.authorize_connect(None, Some(b"bad".as_slice())),
            Err(SecurityError::InvalidToken)
        );
    }
}
