//! Balance staging shared by the store backends.
//!
//! Deltas are computed into a `staged` overlay on top of the committed rows, so a
//! posting that fails halfway leaves the committed map untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

use forgeledger_accounting::{AccountNature, BalanceKey, LedgerBalance};
use forgeledger_core::{AccountId, FiscalPeriod, LedgerResult, TenantId};

pub(crate) fn same_account(a: &BalanceKey, b: &BalanceKey) -> bool {
    a.tenant_id == b.tenant_id && a.account_id == b.account_id
}

fn current<'a>(
    base: &'a BTreeMap<BalanceKey, LedgerBalance>,
    staged: &'a BTreeMap<BalanceKey, LedgerBalance>,
    key: &BalanceKey,
) -> Option<&'a LedgerBalance> {
    staged.get(key).or_else(|| base.get(key))
}

/// Latest row of the same account strictly before `key.period`.
fn latest_before(
    base: &BTreeMap<BalanceKey, LedgerBalance>,
    staged: &BTreeMap<BalanceKey, LedgerBalance>,
    key: &BalanceKey,
) -> Option<LedgerBalance> {
    let pick = |map: &BTreeMap<BalanceKey, LedgerBalance>| {
        map.range(..*key)
            .next_back()
            .filter(|(k, _)| same_account(k, key))
            .map(|(k, _)| *k)
    };
    let latest = match (pick(base), pick(staged)) {
        (Some(b), Some(s)) => Some(b.max(s)),
        (b, s) => b.or(s),
    }?;
    current(base, staged, &latest).cloned()
}

/// Compute the effect of one delta into `staged` without touching `base`.
///
/// The row is opened lazily from the latest earlier period; every later row of
/// the account is re-based so its opening keeps matching the prior closing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn stage_delta(
    base: &BTreeMap<BalanceKey, LedgerBalance>,
    staged: &mut BTreeMap<BalanceKey, LedgerBalance>,
    tenant_id: TenantId,
    account_id: AccountId,
    nature: AccountNature,
    period: FiscalPeriod,
    debit: i64,
    credit: i64,
) -> LedgerResult<LedgerBalance> {
    let key = BalanceKey {
        tenant_id,
        account_id,
        period,
    };

    let mut row = match current(base, staged, &key) {
        Some(existing) => existing.clone(),
        None => {
            let previous = latest_before(base, staged, &key);
            LedgerBalance::open(tenant_id, account_id, nature, period, previous.as_ref())?
        }
    };
    row.apply_delta(debit, credit)?;

    let later: BTreeSet<BalanceKey> = base
        .range((Excluded(key), Unbounded))
        .map(|(k, _)| *k)
        .take_while(|k| same_account(k, &key))
        .chain(
            staged
                .range((Excluded(key), Unbounded))
                .map(|(k, _)| *k)
                .take_while(|k| same_account(k, &key)),
        )
        .collect();

    staged.insert(key, row.clone());
    let mut previous = row.clone();
    for k in later {
        let Some(existing) = current(base, staged, &k) else {
            continue;
        };
        let mut next = existing.clone();
        next.carry_from(&previous)?;
        staged.insert(k, next.clone());
        previous = next;
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn staging_never_touches_the_committed_rows() {
        let (t, a) = (TenantId::new(), AccountId::new());
        let jan = FiscalPeriod::new(2026, 1).unwrap();
        let feb = FiscalPeriod::new(2026, 2).unwrap();

        let mut base = BTreeMap::new();
        let mut seed = BTreeMap::new();
        stage_delta(&base, &mut seed, t, a, AccountNature::Debit, feb, 100, 0).unwrap();
        base.extend(seed);

        let mut staged = BTreeMap::new();
        stage_delta(&base, &mut staged, t, a, AccountNature::Debit, jan, 30, 0).unwrap();

        let feb_key = BalanceKey { tenant_id: t, account_id: a, period: feb };
        assert_eq!(base[&feb_key].opening_debit, 0);
        assert_eq!(staged[&feb_key].opening_debit, 30);
        assert_eq!(staged[&feb_key].closing_debit, 130);
    }

    proptest! {
        /// Back-dated postings in any order keep every later row chained to
        /// the closing of the row before it.
        #[test]
        fn out_of_order_postings_keep_the_chain(
            postings in prop::collection::vec((1u32..7, 0i64..100_000, 0i64..100_000), 1..30),
        ) {
            let (t, a) = (TenantId::new(), AccountId::new());
            let mut base = BTreeMap::new();
            for (month, debit, credit) in &postings {
                let period = FiscalPeriod::new(2025, *month).unwrap();
                let mut staged = BTreeMap::new();
                stage_delta(&base, &mut staged, t, a, AccountNature::Debit, period, *debit, *credit)
                    .unwrap();
                base.extend(staged);
            }

            let rows: Vec<&LedgerBalance> = base.values().collect();
            prop_assert_eq!(rows[0].opening_debit, 0);
            prop_assert_eq!(rows[0].opening_credit, 0);
            for pair in rows.windows(2) {
                prop_assert!(pair[0].period < pair[1].period);
                prop_assert_eq!(pair[1].opening_debit, pair[0].closing_debit);
                prop_assert_eq!(pair[1].opening_credit, pair[0].closing_credit);
            }

            let total_debit: i64 = postings.iter().map(|(_, d, _)| d).sum();
            let total_credit: i64 = postings.iter().map(|(_, _, c)| c).sum();
            let last = rows[rows.len() - 1];
            prop_assert_eq!(last.closing_debit, total_debit);
            prop_assert_eq!(last.closing_credit, total_credit);
            prop_assert_eq!(last.balance, total_debit - total_credit);
        }
    }
}
