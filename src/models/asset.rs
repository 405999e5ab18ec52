use alloy::primitives::Address;
use std::collections::HashMap;

use crate::config::Settings;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub name: String,
    pub coin_id: u64,
    pub decimals: u8,
    pub contract: Option<Address>,
}

/// Tracked assets, plus the native coin, indexed by coin id
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    assets: Vec<AssetInfo>,
    decimals: HashMap<u64, u8>,
    native_coin_id: u64,
}

impl AssetRegistry {
    pub fn new(assets: Vec<AssetInfo>, native_coin_id: u64, native_decimals: u8) -> Self {
        let mut decimals: HashMap<u64, u8> = assets.iter().map(|a| (a.coin_id, a.decimals)).collect();
        decimals.entry(native_coin_id).or_insert(native_decimals);
        Self {
            assets,
            decimals,
            native_coin_id,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let assets = settings
            .assets
            .iter()
            .map(|asset| {
                let contract = asset
                    .contract
                    .as_deref()
                    .map(|c| {
                        c.parse::<Address>().map_err(|e| {
                            AppError::ConfigError(format!("Invalid contract for {}: {}", asset.name, e))
                        })
                    })
                    .transpose()?;
                Ok(AssetInfo {
                    name: asset.name.clone(),
                    coin_id: asset.coin_id,
                    decimals: asset.decimals,
                    contract,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        Ok(Self::new(
            assets,
            settings.blockchain.native_coin_id,
            settings.blockchain.native_decimals,
        ))
    }

    pub fn native_coin_id(&self) -> u64 {
        self.native_coin_id
    }

    pub fn decimals(&self, coin_id: u64) -> Option<u8> {
        self.decimals.get(&coin_id).copied()
    }

    /// Assets that have an ERC20 contract to scan
    pub fn token_contracts(&self) -> impl Iterator<Item = (&AssetInfo, Address)> + '_ {
        self.assets
            .iter()
            .filter_map(|asset| asset.contract.map(|contract| (asset, contract)))
    }

    pub fn assets(&self) -> &[AssetInfo] {
        &self.assets
    }
}
