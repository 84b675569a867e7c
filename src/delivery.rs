use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::catalog::{
    self, COIN_ITEM_ID, GIFT_ITEM_ID, PREMIUM_ITEM_ID, PREMIUM_THRESHOLD, TREASURE_BUNDLE,
    TREASURE_THRESHOLD,
};
use crate::error::AppError;
use crate::game_store::GameStore;
use crate::idempotency::IdempotencyStore;
use crate::metrics::MetricsSink;

/// PayPal caps custom_id at 255 characters; Stripe metadata values at 500.
/// The lower bound applies to both so one codec serves both providers.
const MAX_ENCODED_LEN: usize = 255;

/// The delivery instruction embedded in provider order metadata at creation
/// time and consumed exactly once at capture/webhook time. Keys are kept to
/// one letter so long character names still fit the provider limit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "k")]
pub enum DeliveryInstruction {
    #[serde(rename = "c")]
    Coins {
        #[serde(rename = "n")]
        character: String,
        #[serde(rename = "b")]
        base: u64,
    },
    #[serde(rename = "p")]
    Pack {
        #[serde(rename = "n")]
        character: String,
        #[serde(rename = "i")]
        pack_id: String,
    },
}

impl DeliveryInstruction {
    pub fn character(&self) -> &str {
        match self {
            DeliveryInstruction::Coins { character, .. } => character,
            DeliveryInstruction::Pack { character, .. } => character,
        }
    }

    pub fn encode(&self) -> Result<String, AppError> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| AppError::Validation(format!("unencodable instruction: {e}")))?;
        if encoded.len() > MAX_ENCODED_LEN {
            return Err(AppError::Validation(
                "delivery instruction exceeds provider metadata limit".to_string(),
            ));
        }
        Ok(encoded)
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::Validation(format!("bad delivery instruction: {e}")))
    }
}

/// What a completed delivery credited, mostly for logging and the capture
/// response.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryReport {
    pub character: String,
    pub credited: Vec<CreditedItem>,
    pub amount_cents: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreditedItem {
    pub item_id: u32,
    pub count: u64,
}

/// Delivers everything a confirmed payment bought, then bumps the metrics.
/// Progress is tracked per leg under the provider event id, so a retry after
/// a partial delivery finishes the remaining legs instead of re-crediting
/// the ones that already landed. Store errors propagate to the caller (the
/// capture/webhook handler decides how to answer the provider); metric
/// errors never do.
#[instrument(skip(store, metrics, progress))]
pub async fn fulfill(
    store: &dyn GameStore,
    metrics: &dyn MetricsSink,
    progress: &IdempotencyStore,
    event_id: &str,
    instruction: &DeliveryInstruction,
) -> Result<DeliveryReport, AppError> {
    let report = match instruction {
        DeliveryInstruction::Coins { character, base } => {
            let base = catalog::coin_package(*base)
                .ok_or_else(|| AppError::Validation(format!("unknown coin package {base}")))?;
            let total = base + catalog::coin_bonus(base);

            let mut credited = vec![
                CreditedItem {
                    item_id: COIN_ITEM_ID,
                    count: total,
                },
                CreditedItem {
                    item_id: GIFT_ITEM_ID,
                    count: 1,
                },
            ];
            if base >= PREMIUM_THRESHOLD {
                credited.push(CreditedItem {
                    item_id: PREMIUM_ITEM_ID,
                    count: 1,
                });
            }
            if base >= TREASURE_THRESHOLD {
                for &(item_id, count) in TREASURE_BUNDLE {
                    credited.push(CreditedItem { item_id, count });
                }
            }

            credit_legs(store, progress, event_id, character, &credited).await?;

            let amount_cents = catalog::coin_price_cents(base);
            record_metric_once(progress, event_id, || metrics.record_donation(amount_cents))
                .await;
            DeliveryReport {
                character: character.clone(),
                credited,
                amount_cents,
            }
        }
        DeliveryInstruction::Pack { character, pack_id } => {
            let pack = catalog::starter_pack(pack_id).ok_or_else(|| {
                warn!(pack_id, "instruction references unknown starter pack");
                AppError::Validation(format!("unknown starter pack {pack_id}"))
            })?;

            let credited = vec![CreditedItem {
                item_id: pack.item_id,
                count: 1,
            }];
            credit_legs(store, progress, event_id, character, &credited).await?;
            record_metric_once(progress, event_id, || {
                metrics.record_pack_sale(pack.id, pack.price_cents)
            })
            .await;
            DeliveryReport {
                character: character.clone(),
                credited,
                amount_cents: pack.price_cents,
            }
        }
    };

    info!(
        character = %report.character,
        items = report.credited.len(),
        amount_cents = report.amount_cents,
        "delivery complete"
    );
    Ok(report)
}

/// One credit per leg per event. The credited list is rebuilt identically on
/// a retry, so leg indices line up with the earlier attempt.
async fn credit_legs(
    store: &dyn GameStore,
    progress: &IdempotencyStore,
    event_id: &str,
    character: &str,
    credited: &[CreditedItem],
) -> Result<(), AppError> {
    for (leg, item) in credited.iter().enumerate() {
        let key = format!("{event_id}:leg:{leg}");
        if progress.is_processed(&key).await {
            info!(event_id, leg, item_id = item.item_id, "leg already credited, skipping");
            continue;
        }
        store.credit_item(character, item.item_id, item.count).await?;
        progress.mark_processed(&key).await;
    }
    Ok(())
}

/// Counters are fire-and-forget but still guarded against retries, so a
/// replayed event cannot inflate the donation totals.
async fn record_metric_once<F, Fut>(progress: &IdempotencyStore, event_id: &str, record: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let key = format!("{event_id}:metric");
    if progress.is_processed(&key).await {
        return;
    }
    record().await;
    progress.mark_processed(&key).await;
}
