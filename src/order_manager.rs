use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::{task::JoinSet, time::Instant};

use crate::error::ExchangeError;
use crate::strategy_type::TenantId;
use crate::trading_api::{Order, OrderGateway, OrderRequest, OrderSide};

/// A resting limit order as a strategy wants it to exist on the book.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone)]
pub struct WantedOrder {
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Decimal,
}

impl WantedOrder {
    pub fn new(side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            side,
            amount,
            price,
        }
    }

    fn matches(&self, order: &Order) -> bool {
        order.side == self.side
            && order.price == Some(self.price)
            && order.remaining_amount() == self.amount
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub canceled: usize,
    pub placed: usize,
    pub failed: usize,
}

enum Action {
    Cancel(Result<Order, ExchangeError>),
    Place(Result<Order, ExchangeError>),
}

/// Bring the tenant's open orders on `symbol` carrying `tag` in line with
/// `wanted`. Orders with another tag belong to other strategies and are
/// left alone.
///
/// Open orders that match a wanted entry are kept. The rest are canceled,
/// and missing entries are placed as post-only limits tagged with `tag`.
/// Cancels and placements run concurrently. Individual failures are logged
/// and counted; only failing to list the open orders aborts the call.
pub async fn reconcile_orders(
    gateway: Arc<dyn OrderGateway>,
    tenant: TenantId,
    symbol: &str,
    tag: &str,
    mut wanted: Vec<WantedOrder>,
) -> Result<ReconcileReport, ExchangeError> {
    let start = Instant::now();
    let current = gateway.open_orders(tenant, symbol).await?;
    let mut report = ReconcileReport::default();
    let mut to_cancel = vec![];

    for order in current
        .into_iter()
        .filter(|o| o.client_tag.as_deref() == Some(tag))
    {
        // one open order satisfies at most one wanted entry
        if let Some(i) = wanted.iter().position(|w| w.matches(&order)) {
            log::trace!("order {} already exists", order.order_id);
            wanted.remove(i);
            report.kept += 1;
        } else {
            log::debug!("order {} will be canceled: {:?}", order.order_id, order);
            to_cancel.push(order.order_id);
        }
    }

    let mut js = JoinSet::new();
    for order_id in to_cancel {
        let gateway = gateway.clone();
        let symbol = symbol.to_owned();
        js.spawn(async move {
            Action::Cancel(gateway.cancel_order(tenant, &symbol, order_id).await)
        });
    }
    for w in wanted {
        let gateway = gateway.clone();
        let request = OrderRequest::limit(symbol, w.side, w.amount, w.price).tagged(tag);
        js.spawn(async move { Action::Place(gateway.place_order(tenant, request).await) });
    }

    while let Some(joined) = js.join_next().await {
        match joined {
            Ok(Action::Cancel(Ok(_))) => report.canceled += 1,
            Ok(Action::Place(Ok(_))) => report.placed += 1,
            Ok(Action::Cancel(Err(err))) | Ok(Action::Place(Err(err))) => {
                log::warn!("tenant {}: order action on {} failed: {}", tenant, symbol, err);
                report.failed += 1;
            }
            Err(err) => {
                log::error!("tenant {}: order task did not finish: {}", tenant, err);
                report.failed += 1;
            }
        }
    }

    log::debug!(
        "tenant {}: reconciled {} for {} within {} ms: {:?}",
        tenant,
        symbol,
        tag,
        start.elapsed().as_millis(),
        report
    );
    Ok(report)
}

/// Cancel every open order of the tenant on `symbol` carrying `tag`.
/// Returns how many were canceled.
pub async fn cancel_all(
    gateway: Arc<dyn OrderGateway>,
    tenant: TenantId,
    symbol: &str,
    tag: &str,
) -> Result<usize, ExchangeError> {
    let report = reconcile_orders(gateway, tenant, symbol, tag, Vec::new()).await?;
    Ok(report.canceled)
}
