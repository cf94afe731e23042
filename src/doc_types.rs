//! The closed registry of deferment-supporting document types.
//!
//! The classifier returns one of these canonical names (or something we
//! don't recognize, which stays unknown). Each type carries a localized
//! display name and the length of its validity window.

/// Number of days a document stays valid when no override applies.
pub const DEFAULT_VALIDITY_DAYS: u32 = 40;

/// How long a document of a given type stays acceptable, counted from the
/// document date.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidityRule {
    FixedDays(u32),
}

impl ValidityRule {
    pub fn days(self) -> u32 {
        match self {
            ValidityRule::FixedDays(days) => days,
        }
    }
}

/// One entry in the registry.
#[derive(Clone, Copy, Debug)]
pub struct DocTypeSpec {
    /// Canonical name as the classifier emits it.
    pub name: &'static str,
    /// Russian display name.
    pub display_ru: &'static str,
    pub validity: ValidityRule,
}

/// All document types the service accepts. Kept sorted by name.
pub const DOC_TYPES: &[DocTypeSpec] = &[
    DocTypeSpec {
        name: "certificate_of_illness",
        display_ru: "Справка о болезни",
        validity: ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS),
    },
    DocTypeSpec {
        name: "certificate_of_temporary_incapacity",
        display_ru: "Лист о временной нетрудоспособности",
        validity: ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS),
    },
    DocTypeSpec {
        name: "childbirth_certificate",
        display_ru: "Справка о рождении ребёнка",
        validity: ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS),
    },
    DocTypeSpec {
        name: "conscription_notice",
        display_ru: "Справка о призыве на воинскую службу",
        validity: ValidityRule::FixedDays(365),
    },
    DocTypeSpec {
        name: "disability_certificate",
        display_ru: "Справка об инвалидности",
        validity: ValidityRule::FixedDays(360),
    },
    DocTypeSpec {
        name: "income_loss_certificate",
        display_ru: "Справка о потере дохода",
        validity: ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS),
    },
    DocTypeSpec {
        name: "maternity_leave_order",
        display_ru: "Приказ о декретном отпуске",
        validity: ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS),
    },
    DocTypeSpec {
        name: "medical_conclusion",
        display_ru: "Медицинское заключение",
        validity: ValidityRule::FixedDays(180),
    },
    DocTypeSpec {
        name: "relative_death_certificate",
        display_ru: "Свидетельство о смерти близкого родственника",
        validity: ValidityRule::FixedDays(365),
    },
    DocTypeSpec {
        name: "unemployment_certificate",
        display_ru: "Справка о регистрации в качестве безработного",
        validity: ValidityRule::FixedDays(180),
    },
];

/// Look up a classifier-emitted name in the registry.
pub fn lookup(name: &str) -> Option<&'static DocTypeSpec> {
    DOC_TYPES.iter().find(|spec| spec.name == name)
}

/// The validity rule for a doc type; unknown types get the default so the
/// date check can still run while `DOC_TYPE_UNKNOWN` is reported.
pub fn validity_for(doc_type: Option<&str>) -> ValidityRule {
    doc_type
        .and_then(lookup)
        .map(|spec| spec.validity)
        .unwrap_or(ValidityRule::FixedDays(DEFAULT_VALIDITY_DAYS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known() {
        let spec = lookup("maternity_leave_order").unwrap();
        assert_eq!(spec.validity.days(), DEFAULT_VALIDITY_DAYS);
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup("tax_return").is_none());
    }

    #[test]
    fn test_overrides() {
        assert_eq!(validity_for(Some("disability_certificate")).days(), 360);
        assert_eq!(validity_for(Some("conscription_notice")).days(), 365);
        assert_eq!(validity_for(Some("medical_conclusion")).days(), 180);
        assert_eq!(
            validity_for(Some("certificate_of_illness")).days(),
            DEFAULT_VALIDITY_DAYS
        );
        assert_eq!(validity_for(None).days(), DEFAULT_VALIDITY_DAYS);
    }

    #[test]
    fn test_registry_sorted_and_unique() {
        for pair in DOC_TYPES.windows(2) {
            assert!(pair[0].name < pair[1].name);
        }
    }
}
