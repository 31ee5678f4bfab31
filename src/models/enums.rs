use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Gender {
    Male => "male",
    Female => "female",
    Other => "other",
});

str_enum!(PatientStatus {
    Active => "active",
    Inactive => "inactive",
});

str_enum!(Priority {
    Routine => "routine",
    Urgent => "urgent",
    Stat => "stat",
});

str_enum!(OrderStatus {
    Ordered => "ordered",
    Collected => "collected",
    Processing => "processing",
    DraftResult => "draft_result",
    PendingReview => "pending_review",
    Approved => "approved",
    Cancelled => "cancelled",
});

impl OrderStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Cancelled)
    }

    /// States in which result values may be written.
    pub fn accepts_results(&self) -> bool {
        matches!(self, Self::Collected | Self::Processing | Self::DraftResult)
    }
}

str_enum!(TestCategory {
    Hematology => "hematology",
    Chemistry => "chemistry",
    Microbiology => "microbiology",
    Immunology => "immunology",
    Molecular => "molecular",
    Pathology => "pathology",
    Other => "other",
});

str_enum!(SampleType {
    Blood => "blood",
    Serum => "serum",
    Plasma => "plasma",
    Urine => "urine",
    Stool => "stool",
    Sputum => "sputum",
    Csf => "csf",
    Tissue => "tissue",
    Swab => "swab",
    Other => "other",
});

str_enum!(ParameterKind {
    Numeric => "numeric",
    Categorical => "categorical",
});

str_enum!(ResultFlag {
    Normal => "normal",
    Low => "low",
    High => "high",
    CriticalLow => "critical_low",
    CriticalHigh => "critical_high",
    Abnormal => "abnormal",
});

impl ResultFlag {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalLow | Self::CriticalHigh)
    }

    /// Outside the reference range but not critical.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Low | Self::High | Self::Abnormal)
    }
}

str_enum!(OverallStatus {
    Normal => "normal",
    Abnormal => "abnormal",
    Critical => "critical",
    Inconclusive => "inconclusive",
});

str_enum!(ResultStatus {
    Draft => "draft",
    PendingReview => "pending_review",
    Approved => "approved",
    Voided => "voided",
});

str_enum!(Role {
    SuperAdmin => "super_admin",
    Admin => "admin",
    LabTechnician => "lab_technician",
    Doctor => "doctor",
    Nurse => "nurse",
    Receptionist => "receptionist",
});

str_enum!(ApprovalPolicy {
    Distinct => "distinct",
    AllowSelf => "allow_self",
});
