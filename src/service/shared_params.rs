// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::Result;
use crate::repo::Repo;
use crate::types::SharedParams;

/// Cached view of the global policy record. Writes go through the repository
/// and refresh the snapshot; every consumer reads the snapshot.
pub struct SharedParamsService {
    repo: Arc<dyn Repo>,
    params: RwLock<SharedParams>,
}

impl SharedParamsService {
    /// Load the stored record, seeding defaults on first start.
    pub fn new(repo: Arc<dyn Repo>) -> Result<Self> {
        let params = match repo.shared_params_repo().get_shared_params()? {
            Some(params) => params,
            None => {
                let params = SharedParams::default();
                repo.shared_params_repo().set_shared_params(&params)?;
                params
            }
        };
        Ok(SharedParamsService {
            repo,
            params: RwLock::new(params),
        })
    }

    pub fn get_params(&self) -> SharedParams {
        self.params.read().clone()
    }

    pub fn set_params(&self, params: SharedParams) -> Result<()> {
        self.repo.shared_params_repo().set_shared_params(&params)?;
        info!("shared params updated: {params:?}");
        *self.params.write() = params;
        Ok(())
    }

    /// Re-read the stored record, e.g. after an out-of-band change.
    pub fn refresh_params(&self) -> Result<()> {
        if let Some(params) = self.repo.shared_params_repo().get_shared_params()? {
            *self.params.write() = params;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::memory::MemRepo;

    #[test]
    fn seeds_defaults_and_updates() {
        let repo = Arc::new(MemRepo::new());
        let sps = SharedParamsService::new(repo.clone()).unwrap();
        assert_eq!(sps.get_params(), SharedParams::default());

        let mut params = sps.get_params();
        params.sel_msg_num = 3;
        sps.set_params(params.clone()).unwrap();
        assert_eq!(sps.get_params().sel_msg_num, 3);

        // a second service instance sees the stored record
        let again = SharedParamsService::new(repo).unwrap();
        assert_eq!(again.get_params(), params);
    }
}
