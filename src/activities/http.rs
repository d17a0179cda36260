use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;

use crate::activities::{Activity, ActivityContext, ActivityOutcome};

/// Calls an HTTP endpoint. Inputs (or settings): `url`, `method`, `body`,
/// `headers`. Outputs: `status`, `data`.
#[derive(Debug)]
pub struct HttpActivity {
    client: Client,
}

impl HttpActivity {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for HttpActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Activity for HttpActivity {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, settings: &HashMap<String, Value>) -> Result<()> {
        if let Some(method) = settings.get("method") {
            let method = method.as_str().ok_or_else(|| anyhow!("method must be a string"))?;
            method
                .parse::<reqwest::Method>()
                .map_err(|_| anyhow!("Invalid HTTP method: {}", method))?;
        }
        Ok(())
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let url = ctx
            .input_or_setting("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing required input: url"))?
            .to_string();

        let method_str = ctx.input_or_setting("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let method = method_str
            .parse::<reqwest::Method>()
            .map_err(|_| anyhow!("Invalid HTTP method: {}", method_str))?;

        let mut builder = self.client.request(method, &url);

        if let Some(body) = ctx.input_or_setting("body") {
            builder = builder.json(body);
        }

        if let Some(headers) = ctx.input_or_setting("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v_str) = v.as_str() {
                    builder = builder.header(k, v_str);
                }
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        // Non-JSON bodies come back as null data.
        let data = response.json::<Value>().await.unwrap_or(Value::Null);

        ctx.set_output("status", Value::from(status));
        ctx.set_output("data", data);
        Ok(ActivityOutcome::Done)
    }
}
