use tracing::{info, instrument, warn};

use backchannel_core::ids::UserId;
use backchannel_core::{Role, User};
use backchannel_store::conversations::ConversationRepo;
use backchannel_store::users::UserRepo;
use backchannel_store::StoreError;

/// Where the engine learns about users. The identity provider is external;
/// this seam keeps the engine off ambient state and testable against a
/// fixed directory.
pub trait IdentitySource {
    fn user(&self, id: &UserId) -> Result<User, StoreError>;
    fn users_with_roles(&self, roles: &[Role]) -> Result<Vec<User>, StoreError>;
}

impl IdentitySource for UserRepo {
    fn user(&self, id: &UserId) -> Result<User, StoreError> {
        self.get(id)
    }

    fn users_with_roles(&self, roles: &[Role]) -> Result<Vec<User>, StoreError> {
        self.list_by_roles(roles)
    }
}

/// Which role pairings the engine guarantees at session start. An explicit
/// table rather than hard-coded role checks, so the pairing rules can be
/// adjusted without touching engine logic.
#[derive(Clone, Debug)]
pub struct BootstrapPolicy {
    /// Roles eligible to serve as a regular user's finance contact.
    pub finance_contact_roles: Vec<Role>,
    /// Roles that fan out a direct conversation to every regular user.
    pub fanout_roles: Vec<Role>,
    /// Pair finance-role actors with every other finance-role user.
    pub pair_finance_peers: bool,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            finance_contact_roles: vec![Role::Finance, Role::FinanceOfficer, Role::SuperAdmin],
            fanout_roles: vec![
                Role::Finance,
                Role::FinanceOfficer,
                Role::SuperAdmin,
                Role::Admin,
            ],
            pair_finance_peers: true,
        }
    }
}

/// Tally of one bootstrap run. Failures are already logged and swallowed by
/// the time a caller sees this; bootstrap never blocks a session on them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub ensured: usize,
    pub failed: usize,
}

/// Idempotently guarantees role-mandated direct conversations before a
/// user's first conversation listing in a session. Safe to run on every
/// session start: the directory's pair-uniqueness invariant makes repeated
/// runs converge on the same conversation set.
pub struct BootstrapEngine<I> {
    identity: I,
    conversations: ConversationRepo,
    policy: BootstrapPolicy,
}

impl<I: IdentitySource> BootstrapEngine<I> {
    pub fn new(identity: I, conversations: ConversationRepo) -> Self {
        Self {
            identity,
            conversations,
            policy: BootstrapPolicy::default(),
        }
    }

    pub fn with_policy(identity: I, conversations: ConversationRepo, policy: BootstrapPolicy) -> Self {
        Self { identity, conversations, policy }
    }

    /// Entry point selected by caller role: regular users get a finance
    /// contact, staff roles fan out.
    #[instrument(skip(self, caller), fields(caller = %caller.id, role = %caller.role))]
    pub fn bootstrap(&self, caller: &User) -> BootstrapOutcome {
        let outcome = if caller.role == Role::User {
            self.ensure_finance_contact(caller)
        } else if self.policy.fanout_roles.contains(&caller.role) {
            self.ensure_direct_fanout(caller)
        } else {
            BootstrapOutcome::default()
        };
        info!(ensured = outcome.ensured, failed = outcome.failed, "bootstrap finished");
        outcome
    }

    /// Guarantee exactly one direct conversation between a regular user and
    /// the finance team's designated counterpart: the lowest-id user holding
    /// a contact-eligible role. Deterministic, so repeated sessions always
    /// land on the same counterpart and the pair invariant holds.
    pub fn ensure_finance_contact(&self, caller: &User) -> BootstrapOutcome {
        let mut outcome = BootstrapOutcome::default();
        let contacts = match self.identity.users_with_roles(&self.policy.finance_contact_roles) {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(error = %e, "bootstrap could not list finance contacts");
                outcome.failed += 1;
                return outcome;
            }
        };

        // users_with_roles is id-ordered; the first non-caller entry is the
        // designated contact.
        let Some(contact) = contacts.into_iter().find(|u| u.id != caller.id) else {
            return outcome;
        };

        self.ensure_direct(caller, &contact, &mut outcome);
        outcome
    }

    /// Staff fan-out: a direct conversation with every regular user, plus
    /// finance-peer pairs when policy asks for them. Each creation failure
    /// is logged and skipped; the rest of the fan-out still runs.
    pub fn ensure_direct_fanout(&self, actor: &User) -> BootstrapOutcome {
        let mut outcome = BootstrapOutcome::default();

        match self.identity.users_with_roles(&[Role::User]) {
            Ok(users) => {
                for user in users.iter().filter(|u| u.id != actor.id) {
                    self.ensure_direct(actor, user, &mut outcome);
                }
            }
            Err(e) => {
                warn!(error = %e, "bootstrap could not list regular users");
                outcome.failed += 1;
            }
        }

        if self.policy.pair_finance_peers && actor.role.is_finance() {
            match self.identity.users_with_roles(&self.policy.finance_contact_roles) {
                Ok(peers) => {
                    for peer in peers.iter().filter(|u| u.id != actor.id) {
                        self.ensure_direct(actor, peer, &mut outcome);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "bootstrap could not list finance peers");
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    fn ensure_direct(&self, a: &User, b: &User, outcome: &mut BootstrapOutcome) {
        // Find-or-create: the directory returns the existing conversation
        // for a known pair, so this cannot duplicate.
        match self
            .conversations
            .create(&a.id, &b.name, &[b.id.clone()], None, None)
        {
            Ok(_) => outcome.ensured += 1,
            Err(e) => {
                warn!(counterpart = %b.id, error = %e, "bootstrap pairing failed");
                outcome.failed += 1;
            }
        }
    }
}
