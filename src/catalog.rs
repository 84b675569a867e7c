use serde::{Deserialize, Serialize};

/// Donation coin (Coin of Luck).
pub const COIN_ITEM_ID: u32 = 4037;
/// Gift item delivered with every coin purchase.
pub const GIFT_ITEM_ID: u32 = 6673;
/// 30-day premium account item, added at and above the premium threshold.
pub const PREMIUM_ITEM_ID: u32 = 90045;
/// Treasure bundle, added at and above the treasure threshold.
pub const TREASURE_BUNDLE: &[(u32, u64)] = &[(8742, 5), (8752, 5)];

pub const PREMIUM_THRESHOLD: u64 = 1500;
pub const TREASURE_THRESHOLD: u64 = 3000;

/// Coins cost 1 EUR per 100, so the price in cents is base coins * 1.
pub const CENTS_PER_COIN: u64 = 1;

const COIN_PACKAGES: &[u64] = &[500, 1000, 1500, 3000, 5000, 10_000];

/// Fixed starter pack catalog. Each pack delivers exactly one bundled item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StarterPack {
    pub id: &'static str,
    pub name: &'static str,
    pub item_id: u32,
    pub price_cents: u64,
}

const STARTER_PACKS: &[StarterPack] = &[
    StarterPack {
        id: "basic",
        name: "Basic Starter Pack",
        item_id: 600_623,
        price_cents: 999,
    },
    StarterPack {
        id: "advanced",
        name: "Advanced Starter Pack",
        item_id: 600_624,
        price_cents: 1999,
    },
    StarterPack {
        id: "ultimate",
        name: "Ultimate Starter Pack",
        item_id: 600_625,
        price_cents: 3499,
    },
];

/// What the shop sells, as sent by the frontend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Purchase {
    Coins { base: u64 },
    Pack { pack_id: String },
}

pub fn coin_package(base: u64) -> Option<u64> {
    COIN_PACKAGES.contains(&base).then_some(base)
}

pub fn starter_pack(id: &str) -> Option<&'static StarterPack> {
    STARTER_PACKS.iter().find(|p| p.id == id)
}

/// 10% bonus coins, rounded down.
pub fn coin_bonus(base: u64) -> u64 {
    base / 10
}

pub fn coin_price_cents(base: u64) -> u64 {
    base * CENTS_PER_COIN
}

/// Price and a display label for any purchase, or None for unknown catalog
/// entries.
pub fn price_of(purchase: &Purchase) -> Option<(u64, String)> {
    match purchase {
        Purchase::Coins { base } => {
            let base = coin_package(*base)?;
            Some((
                coin_price_cents(base),
                format!("{} Coins (+{} bonus)", base, coin_bonus(base)),
            ))
        }
        Purchase::Pack { pack_id } => {
            let pack = starter_pack(pack_id)?;
            Some((pack.price_cents, pack.name.to_string()))
        }
    }
}
