// Demo order workflow
//
// orders.charge -> orders.ship -> orders.ship.completed

use std::time::Duration;

use serde_json::json;
use stepflow::workflow::{
    callback_fn, handler_fn, CallbackContext, HandlerError, StepDefaults, StepDefinition,
    StepOutcome, ValidationError, WorkflowRegistry,
};
use stepflow::WorkflowMessage;

pub const CHARGE_TOPIC: &str = "orders.charge";
pub const SHIP_TOPIC: &str = "orders.ship";

const CARD_DECLINED: &str = "CardDeclined";

/// Build the demo registry on top of the configured step defaults
pub fn order_registry(defaults: StepDefaults) -> Result<WorkflowRegistry, ValidationError> {
    WorkflowRegistry::builder()
        .with_defaults(defaults)
        .step(
            StepDefinition::builder(CHARGE_TOPIC, handler_fn(charge))
                .timeout(Duration::from_secs(10))
                .non_retryable([CARD_DECLINED])
                .on_failure("log_failure")
                .next(SHIP_TOPIC),
        )
        .step(
            StepDefinition::builder(SHIP_TOPIC, handler_fn(ship))
                .on_success("log_success")
                .on_failure("log_failure"),
        )
        .callback("log_success", callback_fn(log_callback))
        .callback("log_failure", callback_fn(log_callback))
        .build()
}

/// Demo payload for one order
pub fn order_payload(order_id: u64, amount_cents: u64) -> serde_json::Value {
    json!({ "order_id": order_id, "amount_cents": amount_cents })
}

async fn charge(message: WorkflowMessage) -> Result<StepOutcome, HandlerError> {
    let amount = message.payload["amount_cents"]
        .as_u64()
        .ok_or_else(|| HandlerError::non_retryable("missing amount_cents"))?;

    if amount == 0 {
        return Ok(StepOutcome::Ignore);
    }
    if amount > 100_000 {
        return Err(HandlerError::non_retryable("amount over card limit").with_type(CARD_DECLINED));
    }

    let mut payload = message.payload;
    payload["charged"] = json!(true);
    Ok(StepOutcome::success_with(payload))
}

async fn ship(message: WorkflowMessage) -> Result<StepOutcome, HandlerError> {
    let mut payload = message.payload;
    payload["tracking_number"] = json!(format!("TRK-{}", message.workflow_id.simple()));
    Ok(StepOutcome::success_with(payload))
}

async fn log_callback(ctx: CallbackContext) -> Result<(), HandlerError> {
    match &ctx.error {
        Some(error) => tracing::warn!(
            workflow_id = %ctx.workflow_id,
            topic = %ctx.topic,
            attempt = ctx.attempt,
            error = %error,
            "order step failed"
        ),
        None => tracing::info!(
            workflow_id = %ctx.workflow_id,
            topic = %ctx.topic,
            output = ?ctx.output,
            "order shipped"
        ),
    }
    Ok(())
}
