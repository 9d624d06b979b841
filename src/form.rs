//! Turns the raw expense form into validated records ready for insertion.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{NewExpense, PaymentMethod};
use crate::money::parse_currency;

pub const DEFAULT_CREATOR: &str = "Usuário Padrão";
pub const MAX_INSTALLMENTS: u32 = 48;

/// Switches that used to be separate copies of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub require_receipt: bool,
    pub categories: bool,
    pub installments: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            require_receipt: true,
            categories: true,
            installments: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpenseInput {
    pub item: String,
    pub valor: String,
    pub forma_pagamento: String,
    pub data_vencimento: String,
    pub category_id: Option<i64>,
    pub total_parcelas: Option<u32>,
    pub usuario_criacao: Option<String>,
    pub has_receipt: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("Informe o item da despesa")]
    MissingItem,
    #[error("Informe um valor maior que zero")]
    InvalidAmount,
    #[error("Selecione a forma de pagamento")]
    MissingPaymentMethod,
    #[error("Forma de pagamento desconhecida: {0}")]
    UnknownPaymentMethod(String),
    #[error("Informe a data de vencimento")]
    MissingDueDate,
    #[error("Data de vencimento inválida: {0}")]
    InvalidDueDate(String),
    #[error("Por favor, selecione uma imagem do comprovante")]
    MissingReceipt,
    #[error("Número de parcelas inválido")]
    InvalidInstallmentCount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedExpense {
    pub item: String,
    pub valor_cents: i64,
    pub forma_pagamento: PaymentMethod,
    pub data_vencimento: NaiveDate,
    pub category_id: Option<i64>,
    pub total_parcelas: u32,
    pub usuario_criacao: String,
}

/// Checks every required field. Installments are only honoured when the
/// feature is on and the payment method allows them; otherwise the expense is
/// a single 1/1 record.
pub fn validate(
    input: &ExpenseInput,
    features: &Features,
    creator_fallback: &str,
) -> Result<ValidatedExpense, FormError> {
    let item = input.item.trim();
    if item.is_empty() {
        return Err(FormError::MissingItem);
    }

    let valor_cents = parse_currency(&input.valor).unwrap_or(0);
    if valor_cents <= 0 {
        return Err(FormError::InvalidAmount);
    }

    let method = input.forma_pagamento.trim();
    if method.is_empty() {
        return Err(FormError::MissingPaymentMethod);
    }
    let forma_pagamento: PaymentMethod = method
        .parse()
        .map_err(|_| FormError::UnknownPaymentMethod(method.to_string()))?;

    let due = input.data_vencimento.trim();
    if due.is_empty() {
        return Err(FormError::MissingDueDate);
    }
    let data_vencimento = NaiveDate::parse_from_str(due, "%Y-%m-%d")
        .map_err(|_| FormError::InvalidDueDate(due.to_string()))?;

    if features.require_receipt && !input.has_receipt {
        return Err(FormError::MissingReceipt);
    }

    let total_parcelas = if features.installments && forma_pagamento.allows_installments() {
        let count = input.total_parcelas.unwrap_or(1);
        if count == 0 || count > MAX_INSTALLMENTS {
            return Err(FormError::InvalidInstallmentCount);
        }
        count
    } else {
        1
    };

    let category_id = if features.categories {
        input.category_id
    } else {
        None
    };

    let creator = input
        .usuario_criacao
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(creator_fallback);

    Ok(ValidatedExpense {
        item: item.to_string(),
        valor_cents,
        forma_pagamento,
        data_vencimento,
        category_id,
        total_parcelas,
        usuario_criacao: capitalize_words(creator),
    })
}

/// Expands a validated expense into its installment chain. The first record
/// becomes the parent of the others once inserted; installment `k` is due
/// `k - 1` months after the base due date.
pub fn plan_installments(
    expense: &ValidatedExpense,
    imagem_url: Option<String>,
    created_by: Option<i64>,
) -> Result<Vec<NewExpense>, FormError> {
    let count = i64::from(expense.total_parcelas.max(1));
    let valor_total_cents = expense
        .valor_cents
        .checked_mul(count)
        .ok_or(FormError::InvalidAmount)?;

    let mut planned = Vec::with_capacity(count as usize);
    for index in 0..count {
        let due = expense
            .data_vencimento
            .checked_add_months(Months::new(index as u32))
            .ok_or_else(|| FormError::InvalidDueDate(expense.data_vencimento.to_string()))?;
        planned.push(NewExpense {
            item: expense.item.clone(),
            valor_cents: expense.valor_cents,
            forma_pagamento: expense.forma_pagamento,
            data_vencimento: due,
            category_id: expense.category_id,
            imagem_url: imagem_url.clone(),
            parcela_atual: index + 1,
            total_parcelas: count,
            valor_total_cents,
            usuario_criacao: expense.usuario_criacao.clone(),
            created_by,
        });
    }
    Ok(planned)
}

pub fn capitalize_words(name: &str) -> String {
    name.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    let mut out: String = first.to_uppercase().collect();
                    out.push_str(&chars.as_str().to_lowercase());
                    out
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Name recorded as the expense creator when the form leaves it blank:
/// signed-in profile, then the name last used in this browser, then a default.
pub fn creator_fallback(profile_name: Option<&str>, remembered: Option<&str>) -> String {
    let name = profile_name
        .filter(|name| !name.trim().is_empty())
        .or(remembered.filter(|name| !name.trim().is_empty()))
        .unwrap_or(DEFAULT_CREATOR);
    capitalize_words(name.trim())
}
