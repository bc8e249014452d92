use proptest::prelude::*;

use strand_ledger::{Block, BlockSideband, SendBlock, StateBlock, StoredBlock};
use strand_types::{Account, Amount, BlockHash, Link, Signature};

fn send_block(previous: [u8; 32], destination: [u8; 32], balance: u128) -> Block {
    Block::Send(SendBlock {
        previous: BlockHash::new(previous),
        destination: Account::from_bytes(destination),
        balance: Amount::raw(balance),
        signature: Signature::ZERO,
        work: 0,
    })
}

proptest! {
    /// Hashing is a pure function of the hashable fields.
    #[test]
    fn send_hash_deterministic(
        previous in prop::array::uniform32(0u8..),
        destination in prop::array::uniform32(0u8..),
        balance in any::<u128>(),
    ) {
        let a = send_block(previous, destination, balance);
        let b = send_block(previous, destination, balance);
        prop_assert_eq!(a.hash(), b.hash());
    }

    /// Signature and work never influence the hash.
    #[test]
    fn hash_ignores_non_hashables(
        previous in prop::array::uniform32(0u8..),
        destination in prop::array::uniform32(0u8..),
        balance in any::<u128>(),
        signature in prop::array::uniform32(0u8..),
        work in any::<u64>(),
    ) {
        let plain = send_block(previous, destination, balance);
        let mut decorated = send_block(previous, destination, balance);
        if let Block::Send(send) = &mut decorated {
            let mut sig = [0u8; 64];
            sig[..32].copy_from_slice(&signature);
            send.signature = Signature(sig);
            send.work = work;
        }
        prop_assert_eq!(plain.hash(), decorated.hash());
    }

    /// Changing the balance always changes the hash.
    #[test]
    fn balance_is_hashable(
        previous in prop::array::uniform32(0u8..),
        destination in prop::array::uniform32(0u8..),
        balance in any::<u128>(),
        delta in 1u128..1_000_000,
    ) {
        let a = send_block(previous, destination, balance);
        let b = send_block(previous, destination, balance.wrapping_add(delta));
        prop_assert_ne!(a.hash(), b.hash());
    }

    /// Stored blocks roundtrip through their table encoding.
    #[test]
    fn stored_block_roundtrip(
        account in prop::array::uniform32(0u8..),
        previous in prop::array::uniform32(0u8..),
        link in prop::array::uniform32(0u8..),
        balance in any::<u128>(),
        height in 1u64..u64::MAX,
        timestamp in any::<u64>(),
    ) {
        let stored = StoredBlock {
            block: Block::State(StateBlock {
                account: Account::from_bytes(account),
                previous: BlockHash::new(previous),
                representative: Account::from_bytes(account),
                balance: Amount::raw(balance),
                link: Link::new(link),
                signature: Signature::ZERO,
                work: 0,
            }),
            sideband: BlockSideband {
                account: Account::from_bytes(account),
                height,
                balance: Amount::raw(balance),
                representative: Account::from_bytes(account),
                timestamp,
            },
        };
        let bytes = stored.to_bytes().unwrap();
        prop_assert_eq!(StoredBlock::from_bytes(&bytes).unwrap(), stored);
    }

    /// A block's root is its previous hash, or the account for first
    /// blocks.
    #[test]
    fn root_selection(
        account in prop::array::uniform32(1u8..),
        previous in prop::array::uniform32(0u8..),
    ) {
        let block = Block::State(StateBlock {
            account: Account::from_bytes(account),
            previous: BlockHash::new(previous),
            representative: Account::from_bytes(account),
            balance: Amount::ZERO,
            link: Link::ZERO,
            signature: Signature::ZERO,
            work: 0,
        });
        let root = block.root();
        if BlockHash::new(previous).is_zero() {
            prop_assert_eq!(root.as_bytes(), &account);
        } else {
            prop_assert_eq!(root.as_bytes(), &previous);
        }
    }
}
