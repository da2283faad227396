use crate::domain::order::PaymentRequest;
use crate::domain::ports::{PaymentGateway, PaymentOutcome};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub const DECLINE_MESSAGE: &str = "Payment processing failed. Please try again.";

/// Stand-in for a card processor: waits, then approves a fixed share of
/// payments at random.
pub struct SimulatedPaymentGateway {
    success_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

impl SimulatedPaymentGateway {
    /// # Arguments
    ///
    /// * `success_rate` - Probability in `[0, 1]` that a payment is approved.
    /// * `latency` - Simulated processor round trip.
    /// * `seed` - Fixes the outcome sequence when given.
    pub fn new(success_rate: f64, latency: Duration, seed: Option<u64>) -> Result<Self> {
        if !(0.0..=1.0).contains(&success_rate) {
            return Err(PipelineError::Validation(format!(
                "success rate {success_rate} is outside [0, 1]"
            )));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            success_rate,
            latency,
            rng: Mutex::new(rng),
        })
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn authorize(&self, request: &PaymentRequest) -> Result<PaymentOutcome> {
        tokio::time::sleep(self.latency).await;
        let approved = self.rng.lock().await.gen_bool(self.success_rate);
        debug!(order_id = %request.order_id, approved, "Simulated payment decision");
        if approved {
            Ok(PaymentOutcome::Approved)
        } else {
            Ok(PaymentOutcome::Declined {
                reason: DECLINE_MESSAGE.to_string(),
            })
        }
    }
}

/// Deterministic gateway for tests and dry runs.
///
/// Plays back a script of outcomes, then repeats the fallback forever.
pub struct FixedPaymentGateway {
    script: Mutex<VecDeque<PaymentOutcome>>,
    fallback: PaymentOutcome,
}

impl FixedPaymentGateway {
    pub fn approve_all() -> Self {
        Self::scripted(Vec::new(), PaymentOutcome::Approved)
    }

    pub fn decline_all() -> Self {
        Self::scripted(
            Vec::new(),
            PaymentOutcome::Declined {
                reason: DECLINE_MESSAGE.to_string(),
            },
        )
    }

    pub fn scripted(script: Vec<PaymentOutcome>, fallback: PaymentOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
        }
    }
}

#[async_trait]
impl PaymentGateway for FixedPaymentGateway {
    async fn authorize(&self, _request: &PaymentRequest) -> Result<PaymentOutcome> {
        let next = self.script.lock().await.pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
