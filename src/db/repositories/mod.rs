mod credits;
mod ledger;
mod tasks;
