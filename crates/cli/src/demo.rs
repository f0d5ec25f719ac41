//! The workflow the CLI drives: prepare an inventory sync, push it to a
//! remote API that may be unavailable, then commit the API's answer.

use anyhow::anyhow;
use flux_core::{create_workflow, FluxResult, StepData, StepOptions, WorkflowDefinition};
use serde::{Deserialize, Serialize};

pub const WORKFLOW_NAME: &str = "inventory-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub order_id: u64,
}

/// Build the demo workflow. With `api_down` set the API step answers 503 on
/// every attempt.
pub fn workflow(api_down: bool) -> FluxResult<WorkflowDefinition<SyncRequest>> {
    let workflow = create_workflow(WORKFLOW_NAME)
        .input::<SyncRequest>()
        .step("prepare", |ctx| async move {
            Ok(StepData::new()
                .with("step1", "Done")
                .with("orderId", ctx.input().order_id))
        })?
        .step_with(
            "call-api",
            StepOptions::new().retries(2).timeout_ms(2000),
            move |ctx| async move {
                if api_down {
                    return Err(anyhow!("503 Service Unavailable"));
                }
                tracing::debug!(order_id = ctx.input().order_id, attempt = ctx.attempt, "API call");
                Ok(StepData::new().with("apiResult", "Success from API"))
            },
        )?
        .commit("commit", |ctx| async move {
            let api_result: String = ctx.require("apiResult")?;
            anyhow::Ok(StepData::new().with("committed", api_result))
        })?
        .build();

    Ok(workflow)
}
