//! Workbook schema
//!
//! Sheet names, ID prefixes and the column letters the ledger reads and
//! writes. Row layouts are positional, so builders elsewhere must keep the
//! column order documented on each sheet.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sheet {
    /// A ID, B Created_At, C Email, D Phone, E First, F Last, G Full,
    /// H Email_Opt_In, I SMS_Opt_In, J Default_Shipping_Address_ID,
    /// K Default_Billing_Address_ID, L Source, M Updated_At, N Notes
    Customers,
    /// A ID, B Customer_ID, C Type, D First, E Last, F Company, G Phone,
    /// H Country, I State, J City, K Zip, L Line1, M Line2, N Created_At,
    /// O Updated_At
    Addresses,
    /// A ID .. W Updated_At, T is the payment provider's object ID
    Orders,
    /// A ID, B Order_ID, C Plan_ID, D Name, E Quantity, F Unit_Price,
    /// G Subtotal, H Discount, I Total
    OrderLineItems,
    /// A ID .. W Updated_At, S is the Stripe subscription ID
    Subscriptions,
    /// A ID .. S Updated_At, H status and K charge ID are the dedupe key
    Payments,
    Deliveries,
    Plans,
    DiscountCodes,
}

impl Sheet {
    pub fn name(self) -> &'static str {
        match self {
            Sheet::Customers => "Customers",
            Sheet::Addresses => "Addresses",
            Sheet::Orders => "Orders",
            Sheet::OrderLineItems => "Order Line Items",
            Sheet::Subscriptions => "Subscriptions",
            Sheet::Payments => "Payments",
            Sheet::Deliveries => "Deliveries",
            Sheet::Plans => "Plans (Product_Config - Static)",
            Sheet::DiscountCodes => "Discount Codes (Static)",
        }
    }

    /// ID prefix for sheets whose rows the ledger allocates
    pub fn id_prefix(self) -> Option<&'static str> {
        match self {
            Sheet::Customers => Some("CUS"),
            Sheet::Addresses => Some("ADDR"),
            Sheet::Orders => Some("ORD"),
            Sheet::OrderLineItems => Some("OLI"),
            Sheet::Subscriptions => Some("SUB"),
            Sheet::Payments => Some("PAY"),
            Sheet::Deliveries => Some("DEL"),
            Sheet::Plans | Sheet::DiscountCodes => None,
        }
    }

    /// `Sheet!cells`
    pub fn range(self, cells: &str) -> String {
        format!("{}!{}", self.name(), cells)
    }
}

impl fmt::Display for Sheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Shipping,
    Billing,
}

impl AddressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressKind::Shipping => "Shipping",
            AddressKind::Billing => "Billing",
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column letters used in partial reads and writes
pub mod cols {
    pub mod customers {
        pub const EMAIL: &str = "C:C";
        pub const RECORD: &str = "A{row}:K{row}";
        pub const CONTACT: &str = "D{row}:G{row}";
        pub const ADDRESS_IDS: &str = "J{row}:K{row}";
        pub const SHIPPING_ADDRESS_ID: &str = "J{row}";
        pub const BILLING_ADDRESS_ID: &str = "K{row}";
    }

    pub mod addresses {
        pub const ID: &str = "A:A";
        pub const OWNER_AND_TYPE: &str = "B:C";
        pub const RECORD: &str = "A{row}:M{row}";
        pub const DETAILS: &str = "D{row}:M{row}";
        pub const UPDATED_AT: &str = "O{row}";
    }

    pub mod orders {
        pub const EXTERNAL_ID: &str = "T:T";
    }

    pub mod subscriptions {
        pub const ID: &str = "A:A";
        pub const STRIPE_ID: &str = "S:S";
        pub const STATUS: &str = "D{row}";
        pub const PERIODS: &str = "F{row}:G{row}";
        pub const END_DATE: &str = "H{row}";
        pub const CREATED_FROM_ORDER: &str = "T{row}";
        pub const UPDATED_AT: &str = "W{row}";
    }

    pub mod payments {
        pub const ID: &str = "A:A";
        pub const STATUS_TO_CHARGE: &str = "H:K";
        pub const ORDER_ID: &str = "C{row}";
    }

    pub mod plans {
        pub const TABLE: &str = "A:I";
    }

    pub mod discount_codes {
        pub const TABLE: &str = "A:O";
    }

    /// Fill the `{row}` placeholder of a cell template
    pub fn at(template: &str, row: usize) -> String {
        template.replace("{row}", &row.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_uses_display_name() {
        assert_eq!(Sheet::OrderLineItems.range("A:A"), "Order Line Items!A:A");
        assert_eq!(
            Sheet::Plans.range(cols::plans::TABLE),
            "Plans (Product_Config - Static)!A:I"
        );
    }

    #[test]
    fn test_static_sheets_have_no_prefix() {
        assert_eq!(Sheet::Deliveries.id_prefix(), Some("DEL"));
        assert_eq!(Sheet::DiscountCodes.id_prefix(), None);
    }

    #[test]
    fn test_row_template() {
        assert_eq!(cols::at(cols::customers::ADDRESS_IDS, 7), "J7:K7");
        assert_eq!(cols::at(cols::subscriptions::STATUS, 12), "D12");
    }
}
