// 📌 Fixed reference data shared by every reconciliation run

/// Fiscal years covered by per-program series
pub const FISCAL_YEARS: [&str; 3] = ["2022", "2023", "2024"];

/// The 24 agencies covered by the Chief Financial Officers Act
pub const CFO_ACT_AGENCY_NAMES: [&str; 24] = [
    "Department of Agriculture",
    "Department of Commerce",
    "Department of Defense",
    "Department of Education",
    "Department of Energy",
    "Department of Health and Human Services",
    "Department of Homeland Security",
    "Department of Housing and Urban Development",
    "Department of the Interior",
    "Department of Justice",
    "Department of Labor",
    "Department of State",
    "Department of Transportation",
    "Department of the Treasury",
    "Department of Veterans Affairs",
    "Agency for International Development",
    "Environmental Protection Agency",
    "General Services Administration",
    "National Aeronautics and Space Administration",
    "National Science Foundation",
    "Nuclear Regulatory Commission",
    "Office of Personnel Management",
    "Small Business Administration",
    "Social Security Administration",
];

/// Registry agency names (as the organization source spells them) → display names
pub const AGENCY_DISPLAY_NAMES: &[(&str, &str)] = &[
    ("AGRICULTURE, DEPARTMENT OF", "Department of Agriculture"),
    ("COMMERCE, DEPARTMENT OF", "Department of Commerce"),
    ("DEFENSE, DEPARTMENT OF", "Department of Defense"),
    ("EDUCATION, DEPARTMENT OF", "Department of Education"),
    ("ENERGY, DEPARTMENT OF", "Department of Energy"),
    ("HEALTH AND HUMAN SERVICES, DEPARTMENT OF", "Department of Health and Human Services"),
    ("HOMELAND SECURITY, DEPARTMENT OF", "Department of Homeland Security"),
    ("HOUSING AND URBAN DEVELOPMENT, DEPARTMENT OF", "Department of Housing and Urban Development"),
    ("INTERIOR, DEPARTMENT OF THE", "Department of the Interior"),
    ("JUSTICE, DEPARTMENT OF", "Department of Justice"),
    ("LABOR, DEPARTMENT OF", "Department of Labor"),
    ("STATE, DEPARTMENT OF", "Department of State"),
    ("TRANSPORTATION, DEPARTMENT OF", "Department of Transportation"),
    ("TREASURY, DEPARTMENT OF THE", "Department of the Treasury"),
    ("VETERANS AFFAIRS, DEPARTMENT OF", "Department of Veterans Affairs"),
    ("AGENCY FOR INTERNATIONAL DEVELOPMENT", "Agency for International Development"),
    ("ENVIRONMENTAL PROTECTION AGENCY", "Environmental Protection Agency"),
    ("GENERAL SERVICES ADMINISTRATION", "General Services Administration"),
    ("NATIONAL AERONAUTICS AND SPACE ADMINISTRATION", "National Aeronautics and Space Administration"),
    ("NATIONAL SCIENCE FOUNDATION", "National Science Foundation"),
    ("NUCLEAR REGULATORY COMMISSION", "Nuclear Regulatory Commission"),
    ("OFFICE OF PERSONNEL MANAGEMENT", "Office of Personnel Management"),
    ("SMALL BUSINESS ADMINISTRATION", "Small Business Administration"),
    ("SOCIAL SECURITY ADMINISTRATION", "Social Security Administration"),
];

/// Registry assistance-type labels → display names
pub const ASSISTANCE_TYPE_DISPLAY_NAMES: &[(&str, &str)] = &[
    ("FORMULA GRANTS", "Formula Grants"),
    ("PROJECT GRANTS", "Project Grants"),
    ("DIRECT PAYMENTS FOR SPECIFIED USE", "Direct Payments for Specified Use"),
    ("DIRECT PAYMENTS WITH UNRESTRICTED USE", "Direct Payments with Unrestricted Use"),
    ("DIRECT LOANS", "Direct Loans"),
    ("GUARANTEED/INSURED LOANS", "Guaranteed/Insured Loans"),
    ("INSURANCE", "Insurance"),
    ("SALE, EXCHANGE, OR DONATION OF PROPERTY AND GOODS", "Sale, Exchange, or Donation of Property and Goods"),
    ("USE OF PROPERTY, FACILITIES, AND EQUIPMENT", "Use of Property, Facilities, and Equipment"),
    ("PROVISION OF SPECIALIZED SERVICES", "Provision of Specialized Services"),
    ("ADVISORY SERVICES AND COUNSELING", "Advisory Services and Counseling"),
    ("DISSEMINATION OF TECHNICAL INFORMATION", "Dissemination of Technical Information"),
    ("TRAINING", "Training"),
    ("INVESTIGATION OF COMPLAINTS", "Investigation of Complaints"),
    ("FEDERAL EMPLOYMENT", "Federal Employment"),
];

/// Stored program-type tags → display names
pub const PROGRAM_TYPE_MAPPING: &[(&str, &str)] = &[
    ("assistance_listing", "Federal Financial Assistance"),
    ("tax_expenditure", "Tax Expenditures"),
    ("interest", "Interest on the Public Debt"),
];

// External reference URL templates ({} = listing id / program number / search hash)
pub const SAM_LISTING_URL: &str = "https://sam.gov/fal/{}/view";
pub const GRANTS_SEARCH_URL: &str = "https://grants.gov/search-grants?cfda={}";
pub const USASPENDING_SEARCH_URL: &str = "https://www.usaspending.gov/search/?hash={}";

/// Fill the single `{}` slot of a URL template
pub fn fill_url(template: &str, value: &str) -> String {
    template.replacen("{}", value, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fiscal_years_are_four_digits() {
        assert!(FISCAL_YEARS
            .iter()
            .all(|y| y.len() == 4 && y.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_cfo_act_set_has_24_distinct_names() {
        let unique: HashSet<&str> = CFO_ACT_AGENCY_NAMES.iter().copied().collect();
        assert_eq!(unique.len(), 24);
        assert!(unique.contains("Department of Agriculture"));
        assert!(unique.contains("Department of Defense"));
        assert!(unique.contains("Department of the Treasury"));
    }

    #[test]
    fn test_display_names_map_into_cfo_set() {
        let lookup: std::collections::HashMap<_, _> = AGENCY_DISPLAY_NAMES.iter().copied().collect();
        assert_eq!(
            lookup.get("AGRICULTURE, DEPARTMENT OF"),
            Some(&"Department of Agriculture")
        );
        for (_, display) in AGENCY_DISPLAY_NAMES {
            assert!(CFO_ACT_AGENCY_NAMES.contains(display), "{} not in CFO set", display);
        }
    }

    #[test]
    fn test_program_type_labels() {
        let lookup: std::collections::HashMap<_, _> = PROGRAM_TYPE_MAPPING.iter().copied().collect();
        assert_eq!(lookup["tax_expenditure"], "Tax Expenditures");
        assert_eq!(lookup["assistance_listing"], "Federal Financial Assistance");
        assert_eq!(lookup["interest"], "Interest on the Public Debt");
    }

    #[test]
    fn test_fill_url() {
        assert_eq!(
            fill_url(GRANTS_SEARCH_URL, "10.001"),
            "https://grants.gov/search-grants?cfda=10.001"
        );
        assert_eq!(
            fill_url(SAM_LISTING_URL, "abc"),
            "https://sam.gov/fal/abc/view"
        );
    }
}
