use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Dinheiro,
    Pix,
    CartaoDebito,
    CartaoCredito,
    BoletoPrazo,
    BoletoVista,
    Transferencia,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 7] = [
        PaymentMethod::Dinheiro,
        PaymentMethod::Pix,
        PaymentMethod::CartaoDebito,
        PaymentMethod::CartaoCredito,
        PaymentMethod::BoletoPrazo,
        PaymentMethod::BoletoVista,
        PaymentMethod::Transferencia,
    ];

    /// Label stored in `despesas.forma_pagamento` and shown in the UI.
    pub fn label(self) -> &'static str {
        match self {
            PaymentMethod::Dinheiro => "Dinheiro",
            PaymentMethod::Pix => "PIX",
            PaymentMethod::CartaoDebito => "Cartão de Débito",
            PaymentMethod::CartaoCredito => "Cartão de Crédito",
            PaymentMethod::BoletoPrazo => "Boleto a Prazo",
            PaymentMethod::BoletoVista => "Boleto à Vista",
            PaymentMethod::Transferencia => "Transferência",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            PaymentMethod::Dinheiro => "dinheiro",
            PaymentMethod::Pix => "pix",
            PaymentMethod::CartaoDebito => "cartao_debito",
            PaymentMethod::CartaoCredito => "cartao_credito",
            PaymentMethod::BoletoPrazo => "boleto_prazo",
            PaymentMethod::BoletoVista => "boleto_vista",
            PaymentMethod::Transferencia => "transferencia",
        }
    }

    pub fn badge_class(self) -> &'static str {
        match self {
            PaymentMethod::Pix => "payment-pix",
            PaymentMethod::CartaoCredito => "payment-cartao",
            PaymentMethod::BoletoVista => "payment-boleto-vista",
            PaymentMethod::BoletoPrazo => "payment-boleto-prazo",
            _ => "",
        }
    }

    /// Methods that can be split into monthly installments.
    pub fn allows_installments(self) -> bool {
        matches!(self, PaymentMethod::CartaoCredito | PaymentMethod::BoletoPrazo)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PaymentMethod {
    type Err = ();

    /// Accepts both the stored label and the short code used by older rows.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        PaymentMethod::ALL
            .into_iter()
            .find(|method| {
                method.label().eq_ignore_ascii_case(value) || method.code().eq_ignore_ascii_case(value)
            })
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseStatus {
    Pendente,
    Pago,
}

impl ExpenseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpenseStatus::Pendente => "pendente",
            ExpenseStatus::Pago => "pago",
        }
    }
}

impl FromStr for ExpenseStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pendente" => Ok(ExpenseStatus::Pendente),
            "pago" => Ok(ExpenseStatus::Pago),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Gerente,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Gerente => "gerente",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Admin => "Administrador",
            Role::Gerente => "Gerente",
        }
    }

    /// Admins see and edit every expense; managers only their own.
    pub fn sees_all_expenses(self) -> bool {
        self == Role::Admin
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "gerente" => Ok(Role::Gerente),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Expense {
    pub id: i64,
    pub item: String,
    pub valor_cents: i64,
    pub forma_pagamento: PaymentMethod,
    pub data_vencimento: NaiveDate,
    pub status: ExpenseStatus,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub imagem_url: Option<String>,
    pub parcela_atual: i64,
    pub total_parcelas: i64,
    pub valor_total_cents: i64,
    pub despesa_pai_id: Option<i64>,
    pub usuario_criacao: String,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub data_pagamento: Option<DateTime<Utc>>,
}

impl Expense {
    pub fn is_paid(&self) -> bool {
        self.status == ExpenseStatus::Pago
    }

    pub fn is_installment(&self) -> bool {
        self.total_parcelas > 1 || self.despesa_pai_id.is_some()
    }

    /// Id of the first record of the installment chain this expense belongs to.
    pub fn chain_root(&self) -> i64 {
        self.despesa_pai_id.unwrap_or(self.id)
    }
}

/// Row about to be inserted into `despesas`. Status starts as pending.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub item: String,
    pub valor_cents: i64,
    pub forma_pagamento: PaymentMethod,
    pub data_vencimento: NaiveDate,
    pub category_id: Option<i64>,
    pub imagem_url: Option<String>,
    pub parcela_atual: i64,
    pub total_parcelas: i64,
    pub valor_total_cents: i64,
    pub usuario_criacao: String,
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}
