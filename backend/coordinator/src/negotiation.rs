//! Budget negotiation between a coordinator agent and a validator agent.
//!
//! Both agents live in an external service reached through
//! [`NegotiationAgent`].  Their replies are free text with `KEY: value`
//! lines; anything missing falls back to the previous proposal, and the
//! coordinator's own fallback is the median budget at 5%.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{CoordinatorError, Result};
use crate::pool::NegotiationResult;

pub const FALLBACK_STAKE_PERCENT: u32 = 5;

/// Largest budget, in USD, a participant or an agent may name.
pub const MAX_BUDGET: u64 = 1_000_000_000;

/// Accept a participant budget: finite, positive and at most [`MAX_BUDGET`].
pub fn validate_budget(budget: f64) -> Result<f64> {
    if budget.is_finite() && budget > 0.0 && budget <= MAX_BUDGET as f64 {
        Ok(budget)
    } else {
        Err(CoordinatorError::Validation(format!(
            "Budget must be greater than 0 and at most {MAX_BUDGET}"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Coordinator,
    Validator,
}

#[async_trait]
pub trait NegotiationAgent: Send + Sync {
    /// Run one prompt as `role` and return the agent's raw text output.
    async fn execute(&self, role: AgentRole, prompt: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct AgentReply {
    output: String,
}

/// `POST {base}/execute {role, input}` -> `{output}`
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        HttpAgentClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl NegotiationAgent for HttpAgentClient {
    async fn execute(&self, role: AgentRole, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .json(&json!({ "role": role, "input": prompt }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::Agent(format!("{role:?} agent answered {status}: {body}")));
        }

        let reply: AgentReply = response.json().await?;
        debug!("{role:?} agent replied with {} chars", reply.output.len());
        Ok(reply.output)
    }
}

/// One participant as the negotiation sees them.
#[derive(Debug, Clone, Copy)]
pub struct Bid<'a> {
    pub name: &'a str,
    pub budget: f64,
    pub location: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Upper median: `sorted[len / 2]`.
    pub median: f64,
}

impl BudgetStats {
    pub fn from_budgets(budgets: &[f64]) -> Option<Self> {
        if budgets.is_empty() {
            return None;
        }
        let mut sorted = budgets.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(BudgetStats {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            median: sorted[sorted.len() / 2],
        })
    }
}

/// Fields pulled out of an agent reply.  Each is `None` when absent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub budget: Option<u64>,
    pub percent: Option<u32>,
    pub reasoning: Option<String>,
}

pub fn parse_reply(output: &str) -> ParsedReply {
    ParsedReply {
        budget: find_number(output, "TRIP_BUDGET:", true, None),
        percent: find_number(output, "STAKE_PERCENT:", false, Some('%'))
            .and_then(|n| u32::try_from(n).ok()),
        reasoning: find_reasoning(output),
    }
}

/// First `key` occurrence followed by whitespace, an optional `$`, digits and
/// the optional `terminator`.
fn find_number(text: &str, key: &str, allow_dollar: bool, terminator: Option<char>) -> Option<u64> {
    for (at, _) in text.match_indices(key) {
        let mut rest = text[at + key.len()..].trim_start();
        if allow_dollar {
            rest = rest.strip_prefix('$').unwrap_or(rest);
        }
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            continue;
        }
        if let Some(t) = terminator {
            if !rest[digits_end..].starts_with(t) {
                continue;
            }
        }
        if let Ok(n) = rest[..digits_end].parse() {
            return Some(n);
        }
    }
    None
}

/// Text after `REASONING:` up to a blank line, the next `UPPER_KEY:` line or
/// the end of the reply.
fn find_reasoning(text: &str) -> Option<String> {
    let at = text.find("REASONING:")?;
    let body = text[at + "REASONING:".len()..].trim_start();
    if body.is_empty() {
        return None;
    }

    let mut end = body.len();
    for (i, _) in body.match_indices('\n').filter(|(i, _)| *i > 0) {
        let after = &body[i + 1..];
        if after.starts_with('\n') || starts_with_key(after) {
            end = i;
            break;
        }
    }
    Some(body[..end].trim().to_string())
}

fn starts_with_key(line: &str) -> bool {
    let key_len = line
        .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
        .unwrap_or(line.len());
    key_len > 0 && line[key_len..].starts_with(':')
}

pub struct Negotiator {
    agent: Option<Arc<dyn NegotiationAgent>>,
    max_stake_percent: u32,
    usd_per_hbar: f64,
}

impl Negotiator {
    pub fn new(agent: Option<Arc<dyn NegotiationAgent>>, max_stake_percent: u32, usd_per_hbar: f64) -> Self {
        Negotiator {
            agent,
            max_stake_percent,
            usd_per_hbar,
        }
    }

    /// Agree on a budget and stake for `bids`.  Agent failures are returned
    /// as errors; missing fields in a reply are not.
    pub async fn negotiate(&self, bids: &[Bid<'_>]) -> Result<NegotiationResult> {
        let budgets = bids
            .iter()
            .map(|b| validate_budget(b.budget))
            .collect::<Result<Vec<f64>>>()?;
        let stats = BudgetStats::from_budgets(&budgets)
            .ok_or_else(|| CoordinatorError::Validation("No participants to negotiate for".into()))?;
        // In range: every budget is at most MAX_BUDGET.
        let fallback_budget = (stats.median.round() as u64).max(1);

        let (budget, percent, coordinator_reasoning, validator_reasoning) = match &self.agent {
            Some(agent) => {
                let output = agent
                    .execute(AgentRole::Coordinator, &coordinator_prompt(bids, &stats, self.max_stake_percent))
                    .await?;
                let proposal = parse_reply(&output);
                let proposed_budget = agreed_budget(proposal.budget.unwrap_or(fallback_budget))?;
                let proposed_percent = self.clamp(proposal.percent.unwrap_or(FALLBACK_STAKE_PERCENT));
                let proposed_stake = stake_for(proposed_budget, proposed_percent)?;
                let coordinator_reasoning = proposal.reasoning.unwrap_or(output);

                let output = agent
                    .execute(
                        AgentRole::Validator,
                        &validator_prompt(
                            bids.len(),
                            &stats,
                            proposed_budget,
                            proposed_percent,
                            proposed_stake,
                            self.max_stake_percent,
                        ),
                    )
                    .await?;
                let review = parse_reply(&output);
                (
                    agreed_budget(review.budget.unwrap_or(proposed_budget))?,
                    self.clamp(review.percent.unwrap_or(proposed_percent)),
                    coordinator_reasoning,
                    review.reasoning.unwrap_or(output),
                )
            }
            None => (
                fallback_budget,
                self.clamp(FALLBACK_STAKE_PERCENT),
                format!("No agent service configured; proposing the median budget of ${fallback_budget}."),
                "Accepted the coordinator proposal without review.".to_string(),
            ),
        };

        let participants = bids.len() as u64;
        let stake_amount = stake_for(budget, percent)?;
        let stake_amount_hbar = stake_amount as f64 / self.usd_per_hbar;
        let total_pool = stake_amount
            .checked_mul(participants)
            .ok_or_else(|| CoordinatorError::Validation("Total pool is out of range".into()))?;

        info!("Negotiated budget ${budget} at {percent}% (${stake_amount} each) for {participants} participants");

        Ok(NegotiationResult {
            agreed_budget: budget,
            stake_percentage: percent,
            stake_amount,
            stake_amount_hbar,
            total_pool,
            coordinator_reasoning,
            validator_reasoning,
            final_reasoning: format!(
                "After AI negotiation, we've agreed on a trip budget of ${budget} with a {percent}% stake \
                 (${stake_amount} per person = {stake_amount_hbar:.2} HBAR). This ensures fair commitment \
                 from all {participants} participants. Total pool: ${total_pool}."
            ),
        })
    }

    fn clamp(&self, percent: u32) -> u32 {
        percent.min(self.max_stake_percent)
    }
}

/// Budgets named by an agent obey the same bounds as participant budgets.
fn agreed_budget(budget: u64) -> Result<u64> {
    if (1..=MAX_BUDGET).contains(&budget) {
        Ok(budget)
    } else {
        Err(CoordinatorError::Validation(format!(
            "Agreed budget ${budget} is out of range"
        )))
    }
}

/// `budget * percent / 100`, rounded half up.
fn stake_for(budget: u64, percent: u32) -> Result<u64> {
    budget
        .checked_mul(u64::from(percent))
        .and_then(|n| n.checked_add(50))
        .map(|n| n / 100)
        .ok_or_else(|| CoordinatorError::Validation("Stake amount is out of range".into()))
}

fn coordinator_prompt(bids: &[Bid<'_>], stats: &BudgetStats, max_percent: u32) -> String {
    let listing: Vec<String> = bids
        .iter()
        .enumerate()
        .map(|(i, b)| format!("{}. {}: ${} (wants to go to {})", i + 1, b.name, b.budget, b.location))
        .collect();

    format!(
        "You are coordinating a group trip for {count} people.\n\n\
         Analyze these participant budgets:\n{listing}\n\n\
         Budget Statistics:\n\
         - Minimum: ${min}\n\
         - Maximum: ${max}\n\
         - Average: ${avg:.2}\n\
         - Median: ${median}\n\n\
         Your task:\n\
         1. Decide a FAIR trip budget that works for everyone\n\
         2. Decide a STAKE PERCENTAGE (3-{max_percent}%) to ensure commitment - MAXIMUM {max_percent}%!\n\n\
         Respond ONLY in this format:\n\
         TRIP_BUDGET: $XXXX\n\
         STAKE_PERCENT: X%\n\
         REASONING: [Your detailed reasoning in 2-3 sentences]",
        count = bids.len(),
        listing = listing.join("\n"),
        min = stats.min,
        max = stats.max,
        avg = stats.avg,
        median = stats.median,
    )
}

fn validator_prompt(
    count: usize,
    stats: &BudgetStats,
    budget: u64,
    percent: u32,
    stake: u64,
    max_percent: u32,
) -> String {
    format!(
        "Review this group trip staking proposal:\n\n\
         Participants: {count}\n\
         Budget Range: ${min} - ${max}\n\n\
         Coordinator's Proposal:\n\
         - Trip Budget: ${budget}\n\
         - Stake: {percent}% = ${stake} per person\n\n\
         Validate and respond ONLY in this format (MAXIMUM {max_percent}% stake allowed):\n\
         DECISION: APPROVE or NEGOTIATE\n\
         TRIP_BUDGET: $XXXX\n\
         STAKE_PERCENT: X% (max {max_percent}%)\n\
         REASONING: [Your detailed reasoning in 2-3 sentences]",
        min = stats.min,
        max = stats.max,
    )
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedAgent;
    use super::*;

    fn bids() -> Vec<Bid<'static>> {
        vec![
            Bid { name: "Ana", budget: 1200.0, location: "Lisbon" },
            Bid { name: "Ben", budget: 800.0, location: "Lisbon" },
            Bid { name: "Cy", budget: 1000.0, location: "Porto" },
            Bid { name: "Di", budget: 1500.0, location: "Lisbon" },
        ]
    }

    #[test]
    fn stats_use_upper_median() {
        let stats = BudgetStats::from_budgets(&[1200.0, 800.0, 1000.0, 1500.0]).unwrap();
        assert_eq!(stats.min, 800.0);
        assert_eq!(stats.max, 1500.0);
        assert_eq!(stats.avg, 1125.0);
        assert_eq!(stats.median, 1200.0);
        assert!(BudgetStats::from_budgets(&[]).is_none());
    }

    #[test]
    fn parses_structured_reply() {
        let reply = "TRIP_BUDGET: $1100\nSTAKE_PERCENT: 4%\nREASONING: Close to the median.\nKeeps everyone in.\n\nThanks!";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.budget, Some(1100));
        assert_eq!(parsed.percent, Some(4));
        assert_eq!(
            parsed.reasoning.as_deref(),
            Some("Close to the median.\nKeeps everyone in.")
        );
    }

    #[test]
    fn reasoning_stops_at_next_key() {
        let reply = "DECISION: APPROVE\nREASONING: Fair enough.\nTRIP_BUDGET: 900\nSTAKE_PERCENT: 3%";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.reasoning.as_deref(), Some("Fair enough."));
        assert_eq!(parsed.budget, Some(900));
        assert_eq!(parsed.percent, Some(3));
    }

    #[test]
    fn percent_requires_sign_and_missing_fields_are_none() {
        let parsed = parse_reply("STAKE_PERCENT: 4 percent\nTRIP_BUDGET: lots");
        assert_eq!(parsed, ParsedReply::default());
    }

    #[tokio::test]
    async fn without_agent_uses_median_and_default_percent() {
        let negotiator = Negotiator::new(None, 6, 0.05);
        let result = negotiator.negotiate(&bids()).await.unwrap();

        assert_eq!(result.agreed_budget, 1200);
        assert_eq!(result.stake_percentage, 5);
        assert_eq!(result.stake_amount, 60);
        assert!((result.stake_amount_hbar - 1200.0).abs() < 1e-9);
        assert_eq!(result.total_pool, 240);
        assert!(result.final_reasoning.contains("1200.00 HBAR"));
    }

    #[tokio::test]
    async fn validator_overrides_and_percent_is_clamped() {
        let agent = Arc::new(ScriptedAgent::new(&[
            (AgentRole::Coordinator, "TRIP_BUDGET: $1000\nSTAKE_PERCENT: 10%\nREASONING: Generous."),
            (AgentRole::Validator, "DECISION: NEGOTIATE\nTRIP_BUDGET: $900\nSTAKE_PERCENT: 8%\nREASONING: Too high."),
        ]));
        let negotiator = Negotiator::new(Some(agent.clone()), 6, 0.05);
        let result = negotiator.negotiate(&bids()).await.unwrap();

        assert_eq!(result.agreed_budget, 900);
        assert_eq!(result.stake_percentage, 6);
        assert_eq!(result.stake_amount, 54);
        assert_eq!(result.coordinator_reasoning, "Generous.");
        assert_eq!(result.validator_reasoning, "Too high.");

        // The validator sees the clamped coordinator proposal.
        let prompts = agent.prompts.lock();
        assert!(prompts[1].1.contains("- Stake: 6% = $60 per person"));
    }

    #[tokio::test]
    async fn unparseable_validator_keeps_proposal() {
        let agent = Arc::new(ScriptedAgent::new(&[
            (AgentRole::Coordinator, "TRIP_BUDGET: 1000\nSTAKE_PERCENT: 4%"),
            (AgentRole::Validator, "Looks good to me"),
        ]));
        let result = Negotiator::new(Some(agent), 6, 0.05)
            .negotiate(&bids())
            .await
            .unwrap();

        assert_eq!(result.agreed_budget, 1000);
        assert_eq!(result.stake_percentage, 4);
        assert_eq!(result.validator_reasoning, "Looks good to me");
        assert_eq!(result.coordinator_reasoning, "TRIP_BUDGET: 1000\nSTAKE_PERCENT: 4%");
    }

    #[test]
    fn budget_bounds() {
        assert_eq!(validate_budget(950.5).unwrap(), 950.5);
        assert!(validate_budget(MAX_BUDGET as f64).is_ok());
        for bad in [0.0, -10.0, 1e30, f64::INFINITY, f64::NAN] {
            assert!(matches!(validate_budget(bad), Err(CoordinatorError::Validation(_))));
        }
    }

    #[test]
    fn stake_rounds_half_up_and_reports_overflow() {
        assert_eq!(stake_for(1000, 5).unwrap(), 50);
        assert_eq!(stake_for(1010, 5).unwrap(), 51);
        assert_eq!(stake_for(1009, 5).unwrap(), 50);
        assert!(stake_for(u64::MAX, 6).is_err());
    }

    #[tokio::test]
    async fn oversized_budgets_are_rejected_without_panicking() {
        let bids: Vec<Bid<'static>> = (0..21)
            .map(|_| Bid { name: "Rich", budget: 1e30, location: "Monaco" })
            .collect();
        let err = Negotiator::new(None, 6, 0.05)
            .negotiate(&bids)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[tokio::test]
    async fn largest_budgets_still_add_up() {
        let bids: Vec<Bid<'static>> = (0..21)
            .map(|_| Bid { name: "Max", budget: MAX_BUDGET as f64, location: "Monaco" })
            .collect();
        let result = Negotiator::new(None, 6, 0.05).negotiate(&bids).await.unwrap();
        assert_eq!(result.stake_amount, 50_000_000);
        assert_eq!(result.total_pool, 1_050_000_000);
    }

    #[tokio::test]
    async fn out_of_range_agent_budget_is_rejected() {
        let agent = Arc::new(ScriptedAgent::new(&[
            (AgentRole::Coordinator, "TRIP_BUDGET: $18446744073709551615\nSTAKE_PERCENT: 6%"),
            (AgentRole::Validator, "DECISION: APPROVE"),
        ]));
        let err = Negotiator::new(Some(agent), 6, 0.05)
            .negotiate(&bids())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Agreed budget $18446744073709551615 is out of range");
    }

    #[tokio::test]
    async fn agent_failure_is_an_error() {
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let err = Negotiator::new(Some(agent), 6, 0.05)
            .negotiate(&bids())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Agent(_)));
    }
}
