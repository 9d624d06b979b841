//! Ordering, month filtering and aggregates for the expense table.

use std::cmp::Reverse;

use chrono::{Datelike, NaiveDate};

use crate::models::{Expense, ExpenseStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonthFilter {
    #[default]
    All,
    /// Month of any year, `"06"` in the filter select.
    MonthOfYear(u32),
    /// A calendar month, `"2025-06"`.
    YearMonth(i32, u32),
}

impl MonthFilter {
    pub fn parse(value: &str) -> Option<MonthFilter> {
        let value = value.trim();
        if value.is_empty() {
            return Some(MonthFilter::All);
        }
        if let Some((year, month)) = value.split_once('-') {
            let year: i32 = year.parse().ok()?;
            let month: u32 = month.parse().ok()?;
            return (1..=12)
                .contains(&month)
                .then_some(MonthFilter::YearMonth(year, month));
        }
        let month: u32 = value.parse().ok()?;
        (1..=12)
            .contains(&month)
            .then_some(MonthFilter::MonthOfYear(month))
    }

    pub fn key(&self) -> String {
        match self {
            MonthFilter::All => String::new(),
            MonthFilter::MonthOfYear(month) => format!("{month:02}"),
            MonthFilter::YearMonth(year, month) => format!("{year:04}-{month:02}"),
        }
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        match *self {
            MonthFilter::All => true,
            MonthFilter::MonthOfYear(month) => date.month() == month,
            MonthFilter::YearMonth(year, month) => date.year() == year && date.month() == month,
        }
    }
}

#[derive(Debug)]
pub struct ExpenseListing<'a> {
    pub rows: Vec<&'a Expense>,
    pub total_cents: i64,
    pub count: usize,
    pub pending_cents: i64,
    pub paid_cents: i64,
}

/// Newest first, then by id so equal timestamps render in a stable order.
/// Status never hides a row.
pub fn render<'a>(expenses: &'a [Expense], filter: &MonthFilter) -> ExpenseListing<'a> {
    let mut rows: Vec<&Expense> = expenses
        .iter()
        .filter(|expense| filter.matches(expense.data_vencimento))
        .collect();
    rows.sort_by_key(|expense| Reverse((expense.created_at, expense.id)));

    let mut total_cents = 0;
    let mut pending_cents = 0;
    let mut paid_cents = 0;
    for expense in &rows {
        total_cents += expense.valor_cents;
        match expense.status {
            ExpenseStatus::Pendente => pending_cents += expense.valor_cents,
            ExpenseStatus::Pago => paid_cents += expense.valor_cents,
        }
    }

    ExpenseListing {
        count: rows.len(),
        rows,
        total_cents,
        pending_cents,
        paid_cents,
    }
}

/// Everything the dashboard page needs, passed explicitly to the renderer.
#[derive(Debug, Default)]
pub struct DashboardState {
    pub expenses: Vec<Expense>,
    pub filter: MonthFilter,
}

impl DashboardState {
    pub fn new(expenses: Vec<Expense>, filter: MonthFilter) -> Self {
        DashboardState { expenses, filter }
    }

    pub fn listing(&self) -> ExpenseListing<'_> {
        render(&self.expenses, &self.filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallmentState {
    Paid,
    Overdue,
    Current,
}

#[derive(Debug)]
pub struct InstallmentSchedule<'a> {
    pub entries: Vec<(&'a Expense, InstallmentState)>,
    pub paid: usize,
    pub pending: usize,
}

/// Installments sorted by number, each flagged paid, overdue (pending and due
/// before `today`) or current.
pub fn installment_schedule<'a>(chain: &'a [Expense], today: NaiveDate) -> InstallmentSchedule<'a> {
    let mut entries: Vec<(&Expense, InstallmentState)> = chain
        .iter()
        .map(|expense| {
            let state = if expense.is_paid() {
                InstallmentState::Paid
            } else if expense.data_vencimento < today {
                InstallmentState::Overdue
            } else {
                InstallmentState::Current
            };
            (expense, state)
        })
        .collect();
    entries.sort_by_key(|(expense, _)| (expense.parcela_atual, expense.id));

    let paid = entries
        .iter()
        .filter(|(_, state)| *state == InstallmentState::Paid)
        .count();
    InstallmentSchedule {
        pending: entries.len() - paid,
        entries,
        paid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_748_736_000 + seconds, 0).unwrap()
    }

    fn expense(id: i64, due: &str, valor_cents: i64, created: i64) -> Expense {
        Expense {
            id,
            item: format!("item {id}"),
            valor_cents,
            forma_pagamento: PaymentMethod::Pix,
            data_vencimento: NaiveDate::parse_from_str(due, "%Y-%m-%d").unwrap(),
            status: ExpenseStatus::Pendente,
            category_id: None,
            category_name: None,
            imagem_url: None,
            parcela_atual: 1,
            total_parcelas: 1,
            valor_total_cents: valor_cents,
            despesa_pai_id: None,
            usuario_criacao: "Usuário Padrão".to_string(),
            created_by: None,
            created_at: at(created),
            data_pagamento: None,
        }
    }

    #[test]
    fn parses_both_filter_shapes() {
        assert_eq!(MonthFilter::parse(""), Some(MonthFilter::All));
        assert_eq!(MonthFilter::parse("06"), Some(MonthFilter::MonthOfYear(6)));
        assert_eq!(MonthFilter::parse("2025-06"), Some(MonthFilter::YearMonth(2025, 6)));
        assert_eq!(MonthFilter::parse("13"), None);
        assert_eq!(MonthFilter::parse("2025-00"), None);
        assert_eq!(MonthFilter::parse("junho"), None);
        assert_eq!(MonthFilter::YearMonth(2025, 6).key(), "2025-06");
        assert_eq!(MonthFilter::MonthOfYear(6).key(), "06");
    }

    #[test]
    fn newest_first_with_stable_ties() {
        let expenses = vec![
            expense(1, "2025-06-01", 100, 10),
            expense(2, "2025-06-02", 200, 30),
            expense(3, "2025-06-03", 300, 30),
        ];
        let listing = render(&expenses, &MonthFilter::All);
        let ids: Vec<i64> = listing.rows.iter().map(|e| e.id).collect();
        assert_eq!(ids, [3, 2, 1]);
        assert_eq!(listing.total_cents, 600);
        assert_eq!(listing.count, 3);
    }

    #[test]
    fn month_of_year_spans_years() {
        let expenses = vec![
            expense(1, "2024-06-10", 100, 1),
            expense(2, "2025-06-10", 200, 2),
            expense(3, "2025-07-10", 400, 3),
        ];
        let listing = render(&expenses, &MonthFilter::MonthOfYear(6));
        assert_eq!(listing.count, 2);
        assert_eq!(listing.total_cents, 300);

        let listing = render(&expenses, &MonthFilter::YearMonth(2025, 6));
        assert_eq!(listing.count, 1);
        assert_eq!(listing.total_cents, 200);
    }

    #[test]
    fn paying_moves_amount_from_pending_to_paid() {
        let mut state = DashboardState::new(
            vec![
                expense(1, "2025-06-12", 3550, 1),
                expense(2, "2025-06-20", 18000, 2),
            ],
            MonthFilter::YearMonth(2025, 6),
        );
        let before = state.listing();
        assert_eq!(before.pending_cents, 21550);
        let (before_total, before_count) = (before.total_cents, before.count);

        state.expenses[0].status = ExpenseStatus::Pago;
        state.expenses[0].data_pagamento = Some(at(100));
        let after = state.listing();
        assert_eq!(after.pending_cents, 18000);
        assert_eq!(after.paid_cents, 3550);
        assert_eq!(after.total_cents, before_total);
        assert_eq!(after.count, before_count);
    }

    #[test]
    fn schedule_flags_overdue_and_counts() {
        let mut chain = vec![
            expense(12, "2025-07-10", 100, 1),
            expense(11, "2025-06-10", 100, 1),
            expense(13, "2025-08-10", 100, 1),
        ];
        for (index, record) in chain.iter_mut().enumerate() {
            record.total_parcelas = 3;
            record.parcela_atual = [2, 1, 3][index];
        }
        chain[1].status = ExpenseStatus::Pago;

        let today = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
        let schedule = installment_schedule(&chain, today);
        let states: Vec<InstallmentState> = schedule.entries.iter().map(|(_, s)| *s).collect();
        assert_eq!(
            states,
            [InstallmentState::Paid, InstallmentState::Overdue, InstallmentState::Current]
        );
        assert_eq!(schedule.paid, 1);
        assert_eq!(schedule.pending, 2);
    }

    proptest! {
        #[test]
        fn filter_keeps_exactly_the_month(
            rows in proptest::collection::vec((1u32..=12, 1u32..=28, 0i64..1_000_000), 0..40),
            month in 1u32..=12,
        ) {
            let expenses: Vec<Expense> = rows
                .iter()
                .enumerate()
                .map(|(index, (m, d, cents))| {
                    expense(index as i64, &format!("2025-{m:02}-{d:02}"), *cents, index as i64)
                })
                .collect();
            let listing = render(&expenses, &MonthFilter::MonthOfYear(month));

            let expected: Vec<&Expense> = expenses
                .iter()
                .filter(|e| e.data_vencimento.month() == month)
                .collect();
            prop_assert_eq!(listing.count, expected.len());
            prop_assert_eq!(listing.total_cents, expected.iter().map(|e| e.valor_cents).sum::<i64>());
            prop_assert!(listing.rows.iter().all(|e| e.data_vencimento.month() == month));
        }

        #[test]
        fn calendar_month_filter_separates_years(
            rows in proptest::collection::vec(
                (2023i32..=2026, 1u32..=12, 1u32..=28, 1i64..1_000_000, any::<bool>()),
                0..40,
            ),
            year in 2023i32..=2026,
            month in 1u32..=12,
        ) {
            let expenses: Vec<Expense> = rows
                .iter()
                .enumerate()
                .map(|(index, (y, m, d, cents, paid))| {
                    let mut e = expense(index as i64, &format!("{y:04}-{m:02}-{d:02}"), *cents, index as i64);
                    if *paid {
                        e.status = ExpenseStatus::Pago;
                    }
                    e
                })
                .collect();
            let listing = render(&expenses, &MonthFilter::YearMonth(year, month));

            let expected: Vec<&Expense> = expenses
                .iter()
                .filter(|e| e.data_vencimento.year() == year && e.data_vencimento.month() == month)
                .collect();
            prop_assert_eq!(listing.count, expected.len());
            prop_assert_eq!(listing.total_cents, expected.iter().map(|e| e.valor_cents).sum::<i64>());
            prop_assert_eq!(listing.pending_cents + listing.paid_cents, listing.total_cents);
            prop_assert!(listing
                .rows
                .iter()
                .all(|e| e.data_vencimento.year() == year && e.data_vencimento.month() == month));
        }
    }
}
