//! Postgres order repository.
//!
//! Transitions are single conditional UPDATE statements
//! (`... where order_id = $1 and status = $expected`), so concurrent writers
//! serialize on the row and a duplicate delivery surfaces as a conflict
//! rather than a double-write. The log append rides the same statement.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use swd_schemas::{LogEntry, Order, OrderKind, OrderStatus, LOG_CAP};

use crate::repo::{OrderRepository, TransitionOutcome, TransitionPatch};

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ORDER_COLUMNS: &str = "order_id, kind, token_in, token_out, amount_in, slippage, status, \
     amount_out, dex_used, tx_hash, failure_reason, quotes, logs, created_at, updated_at";

fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<Order> {
    let kind_str: String = row.try_get("kind").context("decode kind")?;
    let status_str: String = row.try_get("status").context("decode status")?;
    let amount_in: String = row.try_get("amount_in").context("decode amount_in")?;
    let slippage: String = row.try_get("slippage").context("decode slippage")?;
    let amount_out: Option<String> = row.try_get("amount_out").context("decode amount_out")?;
    let quotes: serde_json::Value = row.try_get("quotes").context("decode quotes")?;
    let logs: serde_json::Value = row.try_get("logs").context("decode logs")?;

    Ok(Order {
        id: row.try_get("order_id").context("decode order_id")?,
        kind: OrderKind::parse(&kind_str)
            .ok_or_else(|| anyhow!("invalid order kind in database: {kind_str}"))?,
        token_in: row.try_get("token_in").context("decode token_in")?,
        token_out: row.try_get("token_out").context("decode token_out")?,
        amount_in: amount_in
            .parse::<Decimal>()
            .with_context(|| format!("invalid amount_in in database: {amount_in}"))?,
        slippage: slippage
            .parse::<Decimal>()
            .with_context(|| format!("invalid slippage in database: {slippage}"))?,
        status: OrderStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("invalid order status in database: {status_str}"))?,
        amount_out: amount_out
            .map(|s| {
                s.parse::<Decimal>()
                    .with_context(|| format!("invalid amount_out in database: {s}"))
            })
            .transpose()?,
        dex_used: row.try_get("dex_used").context("decode dex_used")?,
        tx_hash: row.try_get("tx_hash").context("decode tx_hash")?,
        failure_reason: row
            .try_get("failure_reason")
            .context("decode failure_reason")?,
        quotes: serde_json::from_value::<BTreeMap<String, String>>(quotes)
            .context("decode quotes json")?,
        logs: serde_json::from_value::<Vec<LogEntry>>(logs).context("decode logs json")?,
        created_at: row.try_get("created_at").context("decode created_at")?,
        updated_at: row.try_get("updated_at").context("decode updated_at")?,
    })
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create(&self, order: Order) -> Result<()> {
        sqlx::query(
            r#"
            insert into swd_orders (
              order_id, kind, token_in, token_out, amount_in, slippage, status,
              quotes, logs, created_at, updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            "#,
        )
        .bind(order.id)
        .bind(order.kind.as_str())
        .bind(&order.token_in)
        .bind(&order.token_out)
        .bind(order.amount_in.to_string())
        .bind(order.slippage.to_string())
        .bind(order.status.as_str())
        .bind(serde_json::to_value(&order.quotes).context("encode quotes")?)
        .bind(serde_json::to_value(&order.logs).context("encode logs")?)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .context("insert order failed")?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from swd_orders where order_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch order failed")?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        patch: TransitionPatch,
        log: LogEntry,
    ) -> Result<TransitionOutcome> {
        if !expected.can_transition_to(to) {
            bail!("illegal order transition: {expected} -> {to}");
        }

        let marker = serde_json::to_value(LogEntry::truncation_marker(Utc::now()))
            .context("encode truncation marker")?;
        // When the appended log would exceed the cap, keep a marker at the
        // head plus the most recent (LOG_CAP - 1) entries.
        let sql = format!(
            r#"
            update swd_orders
               set status         = $3,
                   quotes         = coalesce($4, quotes),
                   dex_used       = coalesce($5, dex_used),
                   tx_hash        = case when $3 = 'failed' then null
                                         else coalesce($6, tx_hash) end,
                   amount_out     = coalesce($7, amount_out),
                   failure_reason = case when $3 = 'failed' then $8
                                         else failure_reason end,
                   logs           = case when jsonb_array_length(logs) < {cap}
                                         then logs || $9
                                         else jsonb_build_array($10::jsonb)
                                              || jsonb_path_query_array(logs || $9, '$[last - {tail} to last]')
                                    end,
                   updated_at     = greatest(now(), updated_at)
             where order_id = $1
               and status = $2
            returning {ORDER_COLUMNS}
            "#,
            cap = LOG_CAP,
            tail = LOG_CAP - 2,
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(to.as_str())
            .bind(
                patch
                    .quotes
                    .map(|q| serde_json::to_value(&q).context("encode quotes"))
                    .transpose()?,
            )
            .bind(patch.dex_used)
            .bind(patch.tx_hash)
            .bind(patch.amount_out.map(|d| d.to_string()))
            .bind(patch.failure_reason)
            .bind(serde_json::to_value(&log).context("encode log entry")?)
            .bind(marker)
            .fetch_optional(&self.pool)
            .await
            .context("conditional transition failed")?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(row_to_order(&row)?));
        }

        // No row moved: either the order does not exist, or a duplicate
        // delivery already advanced it.
        let current: Option<(String,)> =
            sqlx::query_as("select status from swd_orders where order_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("status read-back failed")?;

        match current {
            None => Err(anyhow!("unknown order {id}")),
            Some((status,)) => Ok(TransitionOutcome::Conflict(
                OrderStatus::parse(&status)
                    .ok_or_else(|| anyhow!("invalid order status in database: {status}"))?,
            )),
        }
    }

    async fn append_log(&self, id: Uuid, log: LogEntry) -> Result<()> {
        let marker = serde_json::to_value(LogEntry::truncation_marker(Utc::now()))
            .context("encode truncation marker")?;
        let sql = format!(
            r#"
            update swd_orders
               set logs       = case when jsonb_array_length(logs) < {cap}
                                     then logs || $2
                                     else jsonb_build_array($3::jsonb)
                                          || jsonb_path_query_array(logs || $2, '$[last - {tail} to last]')
                                end,
                   updated_at = greatest(now(), updated_at)
             where order_id = $1
            returning order_id
            "#,
            cap = LOG_CAP,
            tail = LOG_CAP - 2,
        );

        let row: Option<(Uuid,)> = sqlx::query_as(&sql)
            .bind(id)
            .bind(serde_json::to_value(&log).context("encode log entry")?)
            .bind(marker)
            .fetch_optional(&self.pool)
            .await
            .context("append_log failed")?;

        match row {
            Some(_) => Ok(()),
            None => Err(anyhow!("unknown order {id}")),
        }
    }

    async fn stale_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            select order_id from swd_orders
            where status = 'pending'
              and created_at <= $1
            order by created_at asc
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .context("stale_pending query failed")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn healthy(&self) -> bool {
        sqlx::query_as::<_, (i32,)>("select 1")
            .fetch_one(&self.pool)
            .await
            .map(|(one,)| one == 1)
            .unwrap_or(false)
    }
}
