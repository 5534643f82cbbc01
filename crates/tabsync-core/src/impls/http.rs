//! HttpApi - reqwest による BillApi / KdsApi 実装
//!
//! 接続失敗で OnlineFlag を落とし、何かしら応答があれば戻します。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::config::ApiSettings;
use crate::domain::{Bill, CastSelection, NewBill, NewBillItem, PollBatch, Station, Ticket};
use crate::error::ApiError;
use crate::ports::{BillApi, KdsApi, OnlineFlag};

/// Slack on top of the server wait budget before reqwest gives up.
const LONG_POLL_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    online: OnlineFlag,
}

impl HttpApi {
    pub fn new(settings: &ApiSettings, online: OnlineFlag) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            online,
        })
    }

    pub fn online(&self) -> &OnlineFlag {
        &self.online
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                if err.is_connect() {
                    self.online.set(false);
                }
                return Err(err.into());
            }
        };
        self.online.set(true);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let body = self.send(builder).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn discard(&self, builder: RequestBuilder) -> Result<(), ApiError> {
        self.send(builder).await?;
        Ok(())
    }

    async fn patch(&self, id: u64, body: &Value) -> Result<(), ApiError> {
        self.discard(
            self.request(Method::PATCH, &bill_path(id)).json(body),
        )
        .await
    }

    async fn poll<T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError>
    where
        T: DeserializeOwned + Into<PollBatch<Ticket>>,
    {
        let builder = self
            .request(Method::GET, path)
            .query(query)
            .timeout(wait + LONG_POLL_SLACK);
        let body = self.send(builder).await?.text().await?;
        if body.trim().is_empty() {
            return Ok(PollBatch::empty());
        }
        let page: T = serde_json::from_str(&body)?;
        Ok(page.into())
    }
}

fn bill_path(id: u64) -> String {
    format!("/billing/bills/{id}/")
}

/// Server wire shape of the cast update.
fn casts_body(casts: &CastSelection) -> Value {
    let mut body = json!({
        "nominated_casts_w": casts.nom_ids,
        "inhouse_casts_w": casts.in_ids,
        "free_ids": casts.free_ids,
    });
    if !casts.dohan_ids.is_empty() {
        body["dohan_ids"] = json!(casts.dohan_ids);
    }
    body
}

#[derive(Deserialize)]
struct Created {
    id: u64,
}

/// List endpoints answer either a paginated page or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Page { results: Vec<T> },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Page { results } => results,
            Listing::Plain(items) => items,
        }
    }
}

#[derive(Deserialize)]
struct TicketPage {
    #[serde(default)]
    tickets: Vec<Ticket>,
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default, alias = "retry_after", rename = "retryAfter")]
    retry_after_ms: Option<u64>,
}

impl From<TicketPage> for PollBatch<Ticket> {
    fn from(page: TicketPage) -> Self {
        PollBatch {
            items: page.tickets,
            cursor: page.cursor,
            retry_after: page.retry_after_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Deserialize)]
struct ReadyPage {
    #[serde(default)]
    ready: Vec<Ticket>,
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default, alias = "retry_after", rename = "retryAfter")]
    retry_after_ms: Option<u64>,
}

impl From<ReadyPage> for PollBatch<Ticket> {
    fn from(page: ReadyPage) -> Self {
        PollBatch {
            items: page.ready,
            cursor: page.cursor,
            retry_after: page.retry_after_ms.map(Duration::from_millis),
        }
    }
}

#[async_trait]
impl BillApi for HttpApi {
    async fn create_bill(&self, bill: &NewBill) -> Result<u64, ApiError> {
        let created: Created = self
            .json(self.request(Method::POST, "/billing/bills/").json(bill))
            .await?;
        Ok(created.id)
    }

    async fn patch_bill(&self, id: u64, fields: &Map<String, Value>) -> Result<(), ApiError> {
        self.discard(self.request(Method::PATCH, &bill_path(id)).json(fields))
            .await
    }

    async fn update_customers(&self, id: u64, customer_ids: &[u64]) -> Result<(), ApiError> {
        self.patch(id, &json!({ "customer_ids": customer_ids })).await
    }

    async fn update_casts(&self, id: u64, casts: &CastSelection) -> Result<Bill, ApiError> {
        self.json(
            self.request(Method::PATCH, &bill_path(id))
                .json(&casts_body(casts)),
        )
        .await
    }

    async fn add_item(&self, id: u64, item: &NewBillItem) -> Result<(), ApiError> {
        let path = format!("/billing/bills/{id}/items/");
        self.discard(self.request(Method::POST, &path).json(item))
            .await
    }

    async fn update_table(&self, id: u64, table_id: Option<u64>) -> Result<(), ApiError> {
        self.patch(id, &json!({ "table_id": table_id })).await
    }

    async fn delete_bill(&self, id: u64) -> Result<(), ApiError> {
        self.discard(self.request(Method::DELETE, &bill_path(id)))
            .await
    }

    async fn close_bill(&self, id: u64, settled_total: Option<i64>) -> Result<(), ApiError> {
        let path = format!("/billing/bills/{id}/close/");
        let body = match settled_total {
            Some(total) => json!({ "settled_total": total }),
            None => json!({}),
        };
        self.discard(self.request(Method::POST, &path).json(&body))
            .await
    }

    async fn fetch_bill(&self, id: u64) -> Result<Bill, ApiError> {
        self.json(self.request(Method::GET, &bill_path(id))).await
    }

    async fn fetch_bills(&self) -> Result<Vec<Bill>, ApiError> {
        let listing: Listing<Bill> = self
            .json(self.request(Method::GET, "/billing/bills/"))
            .await?;
        Ok(listing.into_vec())
    }
}

#[async_trait]
impl KdsApi for HttpApi {
    async fn list_tickets(&self, station: Station) -> Result<Vec<Ticket>, ApiError> {
        let listing: Listing<Ticket> = self
            .json(
                self.request(Method::GET, "/billing/kds/tickets/")
                    .query(&[("route", station.as_str())]),
            )
            .await?;
        Ok(listing.into_vec())
    }

    async fn long_poll_tickets(
        &self,
        station: Station,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError> {
        let query = [
            ("route", station.as_str().to_string()),
            ("since_id", since_id.to_string()),
            ("wait", wait.as_secs().to_string()),
        ];
        self.poll::<TicketPage>("/billing/kds/longpoll-tickets/", &query, wait)
            .await
    }

    async fn ready_list(&self) -> Result<Vec<Ticket>, ApiError> {
        let listing: Listing<Ticket> = self
            .json(self.request(Method::GET, "/billing/kds/ready/"))
            .await?;
        Ok(listing.into_vec())
    }

    async fn long_poll_ready(
        &self,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError> {
        let query = [
            ("since_id", since_id.to_string()),
            ("wait", wait.as_secs().to_string()),
        ];
        self.poll::<ReadyPage>("/billing/kds/longpoll-ready/", &query, wait)
            .await
    }
}
