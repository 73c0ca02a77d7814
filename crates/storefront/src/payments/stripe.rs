//! Stripe Checkout REST client.
//!
//! Only the two calls the pipeline needs: creating a hosted checkout session
//! and retrieving it. Requests are form-encoded as the Stripe API expects.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use super::{CreateSessionRequest, CreatedSession, PaymentError, PaymentProvider, ProviderSession};
use crate::config::PaymentConfig;

/// Stripe API client.
///
/// Built once from configuration and shared through `Arc<dyn PaymentProvider>`.
#[derive(Clone)]
pub struct StripeClient {
    client: reqwest::Client,
    api_base: Url,
    secret_key: SecretString,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("api_base", &self.api_base.as_str())
            .field("secret_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl StripeClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &PaymentConfig) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// Build `{api_base}/v1/checkout/sessions[/{id}]`, escaping the id.
    fn sessions_url(&self, session_id: Option<&str>) -> Result<Url, PaymentError> {
        let mut url = self.api_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                PaymentError::InvalidRequest("API base URL cannot have a path".to_string())
            })?;
            segments.pop_if_empty().extend(["v1", "checkout", "sessions"]);
            if let Some(id) = session_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PaymentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or(body);
            return Err(PaymentError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

/// Encode a session request as Stripe form parameters.
#[must_use]
pub fn session_form(request: &CreateSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.clone()));
    }

    for (index, item) in request.line_items.iter().enumerate() {
        let prefix = format!("line_items[{index}]");
        form.push((
            format!("{prefix}[price_data][currency]"),
            request.currency.as_str().to_string(),
        ));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            item.unit_amount.to_string(),
        ));
        form.push((
            format!("{prefix}[price_data][product_data][name]"),
            item.name.clone(),
        ));
        form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
    }

    for (key, value) in &request.metadata {
        form.push((format!("metadata[{key}]"), value.clone()));
    }
    form
}

#[async_trait]
impl PaymentProvider for StripeClient {
    #[instrument(skip(self, request), fields(line_items = request.line_items.len()))]
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, PaymentError> {
        let response = self
            .client
            .post(self.sessions_url(None)?)
            .bearer_auth(self.secret_key.expose_secret())
            .form(&session_form(request))
            .send()
            .await?;

        Self::read(response).await
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<ProviderSession, PaymentError> {
        let response = self
            .client
            .get(self.sessions_url(Some(session_id))?)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await?;

        Self::read(response).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use proshop_core::CurrencyCode;

    use super::*;
    use crate::payments::SessionLineItem;

    fn client(base: &str) -> StripeClient {
        StripeClient::new(&PaymentConfig {
            secret_key: SecretString::from("sk_test_51HqLyjWDarjtT1zdp7dc"),
            webhook_secret: SecretString::from("whsec_3f9a0c1d2b7e"),
            api_base: Url::parse(base).unwrap(),
            currency: CurrencyCode::Usd,
            timeout: Duration::from_secs(5),
            webhook_tolerance: Duration::from_secs(300),
        })
        .unwrap()
    }

    #[test]
    fn test_sessions_url() {
        let c = client("https://api.stripe.com");
        assert_eq!(
            c.sessions_url(None).unwrap().as_str(),
            "https://api.stripe.com/v1/checkout/sessions"
        );
        assert_eq!(
            c.sessions_url(Some("cs_test/../x")).unwrap().as_str(),
            "https://api.stripe.com/v1/checkout/sessions/cs_test%2F..%2Fx"
        );

        let proxied = client("http://localhost:12111/stripe/");
        assert_eq!(
            proxied.sessions_url(Some("cs_1")).unwrap().as_str(),
            "http://localhost:12111/stripe/v1/checkout/sessions/cs_1"
        );
    }

    #[test]
    fn test_session_form() {
        let request = CreateSessionRequest {
            line_items: vec![SessionLineItem {
                name: "Classic Tee - M".to_string(),
                unit_amount: 2599,
                quantity: 2,
            }],
            currency: CurrencyCode::Usd,
            success_url: "https://shop.test/checkout/success?session_id={CHECKOUT_SESSION_ID}"
                .to_string(),
            cancel_url: "https://shop.test/checkout/cancel".to_string(),
            customer_email: Some("buyer@example.com".to_string()),
            metadata: BTreeMap::from([("user_id".to_string(), "7".to_string())]),
        };

        let form: BTreeMap<String, String> = session_form(&request).into_iter().collect();
        assert_eq!(form["mode"], "payment");
        assert_eq!(form["customer_email"], "buyer@example.com");
        assert_eq!(form["line_items[0][price_data][currency]"], "usd");
        assert_eq!(form["line_items[0][price_data][unit_amount]"], "2599");
        assert_eq!(form["line_items[0][price_data][product_data][name]"], "Classic Tee - M");
        assert_eq!(form["line_items[0][quantity]"], "2");
        assert_eq!(form["metadata[user_id]"], "7");
    }

    #[test]
    fn test_debug_redacts_key() {
        let output = format!("{:?}", client("https://api.stripe.com"));
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("sk_test"));
    }
}
