use std::time::Duration;

use plume_model::Ticket;
use reqwest::{Client, Response};

use crate::error::LockError;

/// HTTP client of a ticket registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    addr: String,
    client: Client,
}

impl RegistryClient {
    /// `addr` is `host:port`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Result<Self, LockError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LockError::InvalidConfig(format!("registry client: {e}")))?;
        Ok(Self {
            addr: addr.into(),
            client,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, lock_name: &str, op: &str) -> String {
        format!("http://{}/v1/locks/{lock_name}/{op}", self.addr)
    }

    fn error(&self, e: reqwest::Error) -> LockError {
        if e.is_connect() {
            LockError::RegistryUnreachable {
                addr: self.addr.clone(),
                reason: e.to_string(),
            }
        } else {
            LockError::Registry(e.to_string())
        }
    }

    async fn tickets_from(&self, response: Response) -> Result<Vec<Ticket>, LockError> {
        response
            .error_for_status()
            .map_err(|e| self.error(e))?
            .json::<Vec<Ticket>>()
            .await
            .map_err(|e| self.error(e))
    }

    /// Register or refresh `ticket`; returns the queue in service order.
    pub async fn get_tickets(
        &self,
        lock_name: &str,
        ticket: &Ticket,
    ) -> Result<Vec<Ticket>, LockError> {
        let response = self
            .client
            .post(self.url(lock_name, "tickets"))
            .json(ticket)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.tickets_from(response).await
    }

    pub async fn tickets(&self, lock_name: &str) -> Result<Vec<Ticket>, LockError> {
        let response = self
            .client
            .get(self.url(lock_name, "tickets"))
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.tickets_from(response).await
    }

    pub async fn end_work(&self, lock_name: &str, ticket: &Ticket) -> Result<(), LockError> {
        self.client
            .post(self.url(lock_name, "end"))
            .json(ticket)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| self.error(e))?;
        Ok(())
    }
}
