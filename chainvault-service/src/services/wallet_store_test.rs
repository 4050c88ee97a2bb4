//! Tests for the WalletStore

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chainvault_core::account::KeyDerivationService;
    use chainvault_core::chain::{Chain, ChainFamily};

    use crate::database::{DatabasePool, SqlxWalletRepository};
    use crate::error::ServiceError;
    use crate::models::wallet::{InMemoryWalletRepository, WalletRepository};
    use crate::services::wallet_store::WalletStore;
    use crate::storage::MnemonicVault;

    fn create_store(repository: Arc<dyn WalletRepository>) -> WalletStore {
        WalletStore::new(repository, MnemonicVault::new(&[42u8; 32]), KeyDerivationService::default())
    }

    fn create_test_store() -> WalletStore {
        create_store(Arc::new(InMemoryWalletRepository::new()))
    }

    #[tokio::test]
    async fn test_create_wallet_returns_phrase_once() {
        let store = create_test_store();
        let wallet = store.create_wallet("alice").await.unwrap();

        assert_eq!(wallet.mnemonic.word_count(), 12);
        assert_eq!(wallet.addresses.len(), Chain::ALL.len());

        // the phrase derives exactly the stored addresses
        let derived = KeyDerivationService::default().derive(wallet.mnemonic.expose()).unwrap();
        assert_eq!(derived, wallet.addresses);
        assert_eq!(store.get_addresses("alice").await.unwrap(), wallet.addresses);

        // Debug output never carries the phrase
        let debug = format!("{:?}", wallet);
        assert!(!debug.contains(wallet.mnemonic.expose()));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = create_test_store();
        store.create_wallet("alice").await.unwrap();

        assert!(matches!(
            store.create_wallet("alice").await,
            Err(ServiceError::WalletAlreadyExists(user)) if user == "alice"
        ));
        assert!(matches!(store.create_wallet("  ").await, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_addresses() {
        let store = create_test_store();
        assert!(matches!(
            store.get_addresses("nobody").await,
            Err(ServiceError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_replaces_addresses_and_index() {
        let store = create_test_store();
        let first = store.create_wallet("alice").await.unwrap();
        let second = store.reset_wallet("alice").await.unwrap();

        assert_ne!(first.addresses, second.addresses);
        assert_eq!(store.get_addresses("alice").await.unwrap(), second.addresses);

        let old_eth = &first.addresses[&Chain::Ethereum];
        let new_eth = &second.addresses[&Chain::Ethereum];
        assert_eq!(store.owner_of(Chain::Ethereum, old_eth).await.unwrap(), None);
        assert_eq!(store.owner_of(Chain::Ethereum, new_eth).await.unwrap().as_deref(), Some("alice"));

        let retired = store.retired_wallets("alice").await.unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].addresses, first.addresses);

        // reset without a previous wallet creates one
        store.reset_wallet("bob").await.unwrap();
        assert!(store.get_addresses("bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_lookup_normalizes_evm_addresses() {
        let store = create_test_store();
        let wallet = store.create_wallet("alice").await.unwrap();

        let upper = wallet.addresses[&Chain::Base].to_uppercase().replacen("0X", "0x", 1);
        assert_eq!(store.owner_of(Chain::Base, &upper).await.unwrap().as_deref(), Some("alice"));
        assert_eq!(store.owner_of(Chain::Base, "not-an-address").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_monitored_addresses_cover_every_user() {
        let store = create_test_store();
        let alice = store.create_wallet("alice").await.unwrap();
        let bob = store.create_wallet("bob").await.unwrap();

        let monitored = store.get_all_monitored_addresses().await.unwrap();
        for chain in Chain::ALL {
            assert_eq!(monitored[&chain].len(), 2);
            assert!(monitored[&chain].contains(&alice.addresses[&chain]));
            assert!(monitored[&chain].contains(&bob.addresses[&chain]));
        }

        let solana = Chain::in_family(ChainFamily::Solana).count();
        assert_eq!(solana, 1);
    }

    #[tokio::test]
    async fn test_recovery_is_audited() {
        let store = create_test_store();
        let wallet = store.create_wallet("alice").await.unwrap();

        assert!(matches!(
            store.recover_mnemonic("alice", "", "ticket 7").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(store.recoveries("alice").await.unwrap().is_empty());

        let recovered = store.recover_mnemonic("alice", "ops-1", "ticket 7").await.unwrap();
        assert_eq!(recovered, wallet.mnemonic);

        let audit = store.recoveries("alice").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].operator, "ops-1");
        assert_eq!(audit[0].reason, "ticket 7");
    }

    #[tokio::test]
    async fn test_sqlite_backed_store() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = create_store(Arc::new(SqlxWalletRepository::new(pool)));

        let wallet = store.create_wallet("alice").await.unwrap();
        assert!(matches!(
            store.create_wallet("alice").await,
            Err(ServiceError::WalletAlreadyExists(_))
        ));

        let sol = &wallet.addresses[&Chain::Solana];
        assert_eq!(store.owner_of(Chain::Solana, sol).await.unwrap().as_deref(), Some("alice"));

        let recovered = store.recover_mnemonic("alice", "ops-1", "lost device").await.unwrap();
        assert_eq!(recovered, wallet.mnemonic);
    }
}
