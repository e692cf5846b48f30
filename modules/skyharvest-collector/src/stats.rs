use std::ops::AddAssign;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    pub items_collected: u32,
    pub duplicates_skipped: u32,
    pub out_of_range: u32,
    pub malformed_skipped: u32,
    pub branch_failures: u32,
    pub quote_lookups: u32,
    pub batches_written: u32,
    pub registry_additions: u32,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
}

impl AddAssign<&HarvestStats> for HarvestStats {
    fn add_assign(&mut self, other: &HarvestStats) {
        self.items_collected += other.items_collected;
        self.duplicates_skipped += other.duplicates_skipped;
        self.out_of_range += other.out_of_range;
        self.malformed_skipped += other.malformed_skipped;
        self.branch_failures += other.branch_failures;
        self.quote_lookups += other.quote_lookups;
        self.batches_written += other.batches_written;
        self.registry_additions += other.registry_additions;
        self.jobs_succeeded += other.jobs_succeeded;
        self.jobs_failed += other.jobs_failed;
    }
}

impl std::fmt::Display for HarvestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Harvest Complete ===")?;
        writeln!(f, "Jobs succeeded:     {}", self.jobs_succeeded)?;
        writeln!(f, "Jobs failed:        {}", self.jobs_failed)?;
        writeln!(f, "Items collected:    {}", self.items_collected)?;
        writeln!(f, "Duplicates skipped: {}", self.duplicates_skipped)?;
        writeln!(f, "Out of time range:  {}", self.out_of_range)?;
        writeln!(f, "Malformed skipped:  {}", self.malformed_skipped)?;
        writeln!(f, "Branch failures:    {}", self.branch_failures)?;
        writeln!(f, "Quote lookups:      {}", self.quote_lookups)?;
        writeln!(f, "Batches written:    {}", self.batches_written)?;
        write!(f, "New participants:   {}", self.registry_additions)
    }
}
